//! Test doubles shared by the orchestrator, session and agent tests.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use aide_protocol::{
    BackendError, ChatBackend, ChatMessage, ChatRequest, ChatResponse, FunctionCall, Role,
    WireToolCall,
};
use aide_sandbox::{LocalSandboxRunner, SandboxRunner, ShellExecution, ShellRequest};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

pub(crate) fn unique_test_root(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!("{name}-{nanos}"))
}

type Step = Box<dyn Fn(&ChatRequest) -> Result<ChatResponse, BackendError> + Send + Sync>;

/// Backend double that replays queued steps and records every request.
/// Once the script runs out it keeps answering with `fallback`.
pub(crate) struct ScriptedBackend {
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedBackend {
    pub(crate) fn new() -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            fallback: Box::new(|_| Ok(ChatResponse::text("Done."))),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn push(self, step: Step) -> Self {
        self.steps.lock().push_back(step);
        self
    }

    pub(crate) fn reply(self, text: &str) -> Self {
        let text = text.to_owned();
        self.push(Box::new(move |_| Ok(ChatResponse::text(text.clone()))))
    }

    pub(crate) fn reply_with_counts(self, text: &str, prompt: u64, eval: u64) -> Self {
        let text = text.to_owned();
        self.push(Box::new(move |_| {
            let mut response = ChatResponse::text(text.clone());
            response.prompt_eval_count = prompt;
            response.eval_count = eval;
            Ok(response)
        }))
    }

    pub(crate) fn tool_call(self, name: &str, arguments: Value) -> Self {
        let name = name.to_owned();
        self.push(Box::new(move |_| Ok(tool_call_response(&name, arguments.clone()))))
    }

    /// Replies with the content of the most recent `tool` message.
    pub(crate) fn echo_tool_result(self) -> Self {
        self.push(Box::new(|request| {
            let last = request
                .messages
                .iter()
                .rev()
                .find(|message| message.role == Role::Tool)
                .map(|message| message.content.clone())
                .unwrap_or_default();
            Ok(ChatResponse::text(last))
        }))
    }

    pub(crate) fn fail(self, error: fn() -> BackendError) -> Self {
        self.push(Box::new(move |_| Err(error())))
    }

    pub(crate) fn always_tool_call(mut self, name: &str, arguments: Value) -> Self {
        let name = name.to_owned();
        self.fallback = Box::new(move |_| Ok(tool_call_response(&name, arguments.clone())));
        self
    }

    pub(crate) fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

pub(crate) fn tool_call_response(name: &str, arguments: Value) -> ChatResponse {
    let mut message = ChatMessage::assistant("");
    message.tool_calls.push(WireToolCall {
        function: FunctionCall {
            name: name.to_owned(),
            arguments,
        },
    });
    ChatResponse {
        message,
        prompt_eval_count: 0,
        eval_count: 0,
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, BackendError> {
        let step = self.steps.lock().pop_front();
        let response = match step {
            Some(step) => step(&request),
            None => (self.fallback)(&request),
        };
        self.requests.lock().push(request);
        response
    }
}

/// Sandbox that counts spawns before delegating to the local runner.
#[derive(Default)]
pub(crate) struct CountingSandbox {
    inner: LocalSandboxRunner,
    runs: AtomicUsize,
}

impl CountingSandbox {
    pub(crate) fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxRunner for CountingSandbox {
    async fn run(&self, request: ShellRequest) -> anyhow::Result<ShellExecution> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.inner.run(request).await
    }
}
