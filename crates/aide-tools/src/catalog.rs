use std::sync::Arc;

use aide_memory::FactStore;
use aide_sandbox::SandboxRunner;

use crate::{
    CleanupMemoryTool, FetchWebpageTool, GlobTool, ListDirectoryTool, NewsTool,
    OpenApplicationTool, ReadFileTool, RecallTool, RememberTool, SearchFilesTool,
    SetUserNameTool, ShellTool, StockPriceTool, StrReplaceTool, SystemStatsTool, ToolRegistry,
    WeatherTool, WebEndpoints, WebSearchTool, WriteFileTool,
};

/// Output budget for the coding catalog, where whole files are read back.
const CODING_OUTPUT_BUDGET: usize = 20_000;

/// Collaborators the assistant catalog is built from.
#[derive(Clone)]
pub struct AssistantToolset {
    pub sandbox: Arc<dyn SandboxRunner>,
    pub memory: Arc<FactStore>,
    pub http: reqwest::Client,
    pub endpoints: WebEndpoints,
}

/// Tools offered by the command orchestrator.
pub fn assistant_catalog(toolset: AssistantToolset) -> ToolRegistry {
    let AssistantToolset {
        sandbox,
        memory,
        http,
        endpoints,
    } = toolset;
    let search = WebSearchTool::with_search_url(http.clone(), endpoints.search);
    ToolRegistry::default()
        .with(ShellTool::assistant(sandbox.clone()))
        .with(WriteFileTool::create_file())
        .with(ReadFileTool::plain())
        .with(ListDirectoryTool::default())
        .with(SearchFilesTool::by_name())
        .with(OpenApplicationTool)
        .with(SystemStatsTool::new(sandbox))
        .with(search.clone())
        .with(FetchWebpageTool::new(http.clone()))
        .with(WeatherTool::with_base_url(http.clone(), endpoints.weather))
        .with(NewsTool::new(search))
        .with(StockPriceTool::with_base_url(http, endpoints.stocks))
        .with(RememberTool::new(memory.clone()))
        .with(RecallTool::new(memory.clone()))
        .with(SetUserNameTool::new(memory.clone()))
        .with(CleanupMemoryTool::new(memory))
}

/// Tools offered by the terminal coding agent.
pub fn coding_catalog(sandbox: Arc<dyn SandboxRunner>) -> ToolRegistry {
    ToolRegistry::new(CODING_OUTPUT_BUDGET)
        .with(ReadFileTool::numbered())
        .with(WriteFileTool::write_file())
        .with(StrReplaceTool)
        .with(ShellTool::bash(sandbox))
        .with(SearchFilesTool::by_content())
        .with(GlobTool)
        .with(ListDirectoryTool::new(100, false))
}
