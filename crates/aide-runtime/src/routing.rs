//! Cheap text heuristics around backend calls: model routing, offline
//! replies and cleanup of tool-call JSON leaked into reply text.

use chrono::{DateTime, Local};
use serde_json::Value;

/// Utterances longer than this always go to the full model.
pub const FAST_ROUTE_MAX_WORDS: usize = 6;

const FAST_PATTERNS: &[&str] = &[
    "hello",
    "hi",
    "hey",
    "good morning",
    "good afternoon",
    "good evening",
    "how are you",
    "what time",
    "what's the time",
    "time is it",
    "thanks",
    "thank you",
    "ok",
    "okay",
    "cool",
    "great",
    "got it",
    "nice",
    "bye",
    "goodbye",
];

const GREETINGS: &[&str] = &["hello", "hi", "hey"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRoute {
    /// Lightweight model, no tool catalog.
    Fast,
    /// Reasoning model with the full tool catalog.
    Full,
}

fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '\'' { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn contains_phrase(normalized: &str, phrase: &str) -> bool {
    format!(" {normalized} ").contains(&format!(" {phrase} "))
}

pub fn route_model(text: &str) -> ModelRoute {
    let normalized = normalize(text);
    let words = normalized.split_whitespace().count();
    if words == 0 || words > FAST_ROUTE_MAX_WORDS {
        return ModelRoute::Full;
    }
    if FAST_PATTERNS.iter().any(|p| contains_phrase(&normalized, p)) {
        ModelRoute::Fast
    } else {
        ModelRoute::Full
    }
}

/// Deterministic reply used when the backend cannot be reached.
pub fn fallback_reply(text: &str, now: DateTime<Local>) -> String {
    let normalized = normalize(text);
    let first = normalized.split_whitespace().next().unwrap_or_default();
    if GREETINGS.contains(&first) || normalized.starts_with("good ") {
        return "Hello! The language model seems to be offline right now.".to_owned();
    }
    if contains_phrase(&normalized, "time") {
        return format!("It's {}.", now.format("%I:%M %p"));
    }
    format!("I heard: \"{}\". The language model is offline.", text.trim())
}

/// Removes JSON objects shaped like tool calls (`{"name": .., "arguments"|"parameters": ..}`)
/// that some models print into the reply instead of using structured calls,
/// together with a code fence wrapping nothing else. Replies without such an
/// object come back unchanged.
pub fn strip_leaked_tool_json(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    let mut removed = false;
    while let Some(start) = rest.find('{') {
        let candidate = &rest[start..];
        match balanced_object_len(candidate) {
            Some(len) if looks_like_tool_call(&candidate[..len]) => {
                let mut before = &rest[..start];
                let mut after = &candidate[len..];
                if let (Some(close), Some(open)) =
                    (closing_fence(after), opening_fence(&out, before))
                {
                    before = open;
                    after = close;
                }
                out.push_str(before);
                let kept = out.trim_end().len();
                let after_trimmed = after.trim_start();
                let gap_has_break = out[kept..].contains('\n')
                    || after[..after.len() - after_trimmed.len()].contains('\n');
                out.truncate(kept);
                if !out.is_empty() && !after_trimmed.is_empty() {
                    out.push(if gap_has_break { '\n' } else { ' ' });
                }
                rest = after_trimmed;
                removed = true;
            }
            _ => {
                out.push_str(&rest[..=start]);
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    if removed { out.trim().to_owned() } else { out }
}

/// `before` minus a trailing fence opener on its own line. A bare fence only
/// counts as an opener when the fences before it are balanced.
fn opening_fence<'a>(emitted: &str, before: &'a str) -> Option<&'a str> {
    let trimmed = before.trim_end();
    let prefix = trimmed
        .strip_suffix("```json")
        .or_else(|| trimmed.strip_suffix("```"))?;
    if !(prefix.is_empty() || prefix.ends_with('\n')) {
        return None;
    }
    let earlier_fences = emitted.matches("```").count() + prefix.matches("```").count();
    (earlier_fences % 2 == 0).then_some(prefix)
}

/// `after` minus a leading fence closer that ends its line.
fn closing_fence(after: &str) -> Option<&str> {
    let remainder = after.trim_start().strip_prefix("```")?;
    (remainder.is_empty() || remainder.starts_with('\n') || remainder.starts_with("\r\n"))
        .then_some(remainder)
}

fn balanced_object_len(text: &str) -> Option<usize> {
    let mut depth = 0_usize;
    let mut in_string = false;
    let mut escaped = false;
    for (index, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(index + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn looks_like_tool_call(blob: &str) -> bool {
    match serde_json::from_str::<Value>(blob) {
        Ok(Value::Object(map)) => {
            map.get("name").is_some_and(Value::is_string)
                && (map.contains_key("arguments") || map.contains_key("parameters"))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn short_canned_phrases_take_the_fast_route() {
        assert_eq!(route_model("Hello!"), ModelRoute::Fast);
        assert_eq!(route_model("hey, what time is it?"), ModelRoute::Fast);
        assert_eq!(route_model("thanks"), ModelRoute::Fast);
        assert_eq!(route_model("ls -la"), ModelRoute::Full);
        assert_eq!(route_model("history of the roman empire"), ModelRoute::Full);
        assert_eq!(
            route_model("hello can you list every file in my downloads folder"),
            ModelRoute::Full
        );
        assert_eq!(route_model(""), ModelRoute::Full);
    }

    #[test]
    fn fallback_replies_are_deterministic() {
        let now = Local
            .with_ymd_and_hms(2026, 10, 19, 14, 5, 0)
            .single()
            .expect("valid local time");
        assert_eq!(
            fallback_reply("hi there", now),
            "Hello! The language model seems to be offline right now."
        );
        assert_eq!(fallback_reply("what's the time", now), "It's 02:05 PM.");
        assert_eq!(
            fallback_reply("open the pod bay doors", now),
            "I heard: \"open the pod bay doors\". The language model is offline."
        );
    }

    #[test]
    fn leaked_tool_call_json_is_removed() {
        let leaked = "Sure, checking now.\n```json\n{\"name\": \"get_weather\", \"parameters\": {\"location\": \"Paris\"}}\n```";
        assert_eq!(strip_leaked_tool_json(leaked), "Sure, checking now.");

        let prose = "Use {braces} freely; {\"a\": 1} stays.";
        assert_eq!(strip_leaked_tool_json(prose), prose);
    }

    #[test]
    fn replies_without_tool_json_pass_through_untouched() {
        let reply = "Run this:\n\n```sh\nls -la\n```\n\nThen check the output.";
        assert_eq!(strip_leaked_tool_json(reply), reply);

        let indented = "  Two paragraphs.\n\n  ```json\n  {\"ok\": true}\n  ```\n";
        assert_eq!(strip_leaked_tool_json(indented), indented);
    }

    #[test]
    fn only_the_fence_wrapping_the_call_is_removed() {
        let mixed = "Listing:\n```sh\nls\n```\n{\"name\": \"bash\", \"arguments\": {}}\n\nDone.";
        assert_eq!(strip_leaked_tool_json(mixed), "Listing:\n```sh\nls\n```\nDone.");

        let inline = "Checking {\"name\": \"recall\", \"arguments\": {}} now.";
        assert_eq!(strip_leaked_tool_json(inline), "Checking now.");
    }
}
