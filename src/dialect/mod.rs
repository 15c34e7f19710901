pub mod claude;
pub mod openai;

use std::sync::OnceLock;

use chrono::Utc;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role/content pair as both dialects feed it into prompt assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: Value,
}

/// Thinking/search switches per public model id. Unknown ids are rejected
/// with 503 by the handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelFlags {
    pub thinking: bool,
    pub search: bool,
}

pub fn resolve_model_flags(model: &str) -> Option<ModelFlags> {
    match model.trim().to_lowercase().as_str() {
        "deepseek-v3" | "deepseek-chat" => Some(ModelFlags {
            thinking: false,
            search: false,
        }),
        "deepseek-r1" | "deepseek-reasoner" => Some(ModelFlags {
            thinking: true,
            search: false,
        }),
        "deepseek-v3-search" | "deepseek-chat-search" => Some(ModelFlags {
            thinking: false,
            search: true,
        }),
        "deepseek-r1-search" | "deepseek-reasoner-search" => Some(ModelFlags {
            thinking: true,
            search: true,
        }),
        _ => None,
    }
}

/// Upstream stream identifier: UTC date plus 16 random hex characters.
pub fn new_client_stream_id() -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..16)
        .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
        .collect();
    format!("{}-{}", Utc::now().format("%Y%m%d"), suffix)
}

/// Four-characters-per-token heuristic used for all usage accounting.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

/// Flatten message content into plain text: strings pass through, content
/// arrays contribute their `text` blocks and JSON-stringified `tool_result`
/// blocks joined by newlines, anything else is JSON-stringified.
pub fn extract_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                match item.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(t) = item.get("text").and_then(Value::as_str) {
                            parts.push(t.to_string());
                        }
                    }
                    Some("tool_result") => {
                        if let Some(c) = item.get("content") {
                            parts.push(c.to_string());
                        }
                    }
                    _ => {}
                }
            }
            parts.join("\n")
        }
        other => other.to_string(),
    }
}

fn image_markdown_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"!\[(.*?)\]\((.*?)\)").unwrap())
}

/// Collapse a message list into the upstream's single prompt string.
///
/// Consecutive same-role messages merge with a blank line. Assistant turns
/// are wrapped in `<｜Assistant｜>…<｜end▁of▁sentence｜>`; user and system
/// turns after the first get a `<｜User｜>` marker. Markdown image embeds
/// are rewritten to plain links.
pub fn messages_prepare(messages: &[ChatMessage]) -> String {
    let processed: Vec<(String, String)> = messages
        .iter()
        .map(|m| (m.role.clone(), extract_text(&m.content)))
        .collect();
    if processed.is_empty() {
        return String::new();
    }

    let mut merged: Vec<(String, String)> = vec![processed[0].clone()];
    for (role, text) in &processed[1..] {
        let last = merged.last_mut().unwrap();
        if *role == last.0 {
            last.1.push_str("\n\n");
            last.1.push_str(text);
        } else {
            merged.push((role.clone(), text.clone()));
        }
    }

    let mut prompt = String::new();
    for (i, (role, text)) in merged.iter().enumerate() {
        match role.as_str() {
            "assistant" => {
                prompt.push_str("<｜Assistant｜>");
                prompt.push_str(text);
                prompt.push_str("<｜end▁of▁sentence｜>");
            }
            "user" | "system" => {
                if i > 0 {
                    prompt.push_str("<｜User｜>");
                }
                prompt.push_str(text);
            }
            _ => prompt.push_str(text),
        }
    }

    image_markdown_re()
        .replace_all(&prompt, "[$1]($2)")
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(role: &str, content: &str) -> ChatMessage {
        ChatMessage {
            role: role.to_string(),
            content: json!(content),
        }
    }

    #[test]
    fn flags_cover_the_model_table() {
        assert_eq!(
            resolve_model_flags("deepseek-chat"),
            Some(ModelFlags {
                thinking: false,
                search: false
            })
        );
        assert_eq!(
            resolve_model_flags("deepseek-reasoner"),
            Some(ModelFlags {
                thinking: true,
                search: false
            })
        );
        assert_eq!(
            resolve_model_flags("deepseek-v3-search"),
            Some(ModelFlags {
                thinking: false,
                search: true
            })
        );
        assert_eq!(
            resolve_model_flags("DeepSeek-R1-Search"),
            Some(ModelFlags {
                thinking: true,
                search: true
            })
        );
        assert_eq!(resolve_model_flags("gpt-4"), None);
    }

    #[test]
    fn merges_consecutive_same_role_messages() {
        let prompt = messages_prepare(&[
            msg("user", "first"),
            msg("user", "second"),
            msg("assistant", "reply"),
        ]);
        assert_eq!(
            prompt,
            "first\n\nsecond<｜Assistant｜>reply<｜end▁of▁sentence｜>"
        );
    }

    #[test]
    fn later_user_turns_get_a_marker() {
        let prompt = messages_prepare(&[
            msg("system", "rules"),
            msg("user", "question"),
            msg("assistant", "answer"),
            msg("user", "follow-up"),
        ]);
        assert_eq!(
            prompt,
            "rules<｜User｜>question<｜Assistant｜>answer<｜end▁of▁sentence｜><｜User｜>follow-up"
        );
    }

    #[test]
    fn rewrites_markdown_images_to_links() {
        let prompt = messages_prepare(&[msg("user", "see ![diagram](http://x/y.png) here")]);
        assert_eq!(prompt, "see [diagram](http://x/y.png) here");
    }

    #[test]
    fn prompt_assembly_is_deterministic() {
        let messages = vec![msg("user", "a"), msg("assistant", "b"), msg("user", "c")];
        assert_eq!(messages_prepare(&messages), messages_prepare(&messages));
    }

    #[test]
    fn extract_text_handles_content_blocks() {
        let content = json!([
            {"type": "text", "text": "hello"},
            {"type": "tool_result", "content": {"ok": true}},
            {"type": "image", "source": "ignored"},
        ]);
        assert_eq!(extract_text(&content), "hello\n{\"ok\":true}");
    }

    #[test]
    fn stream_ids_carry_the_date_prefix() {
        let id = new_client_stream_id();
        let (date, suffix) = id.split_once('-').unwrap();
        assert_eq!(date.len(), 8);
        assert_eq!(suffix.len(), 16);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn token_estimate_divides_by_four() {
        assert_eq!(estimate_tokens("abcdefghijklmnop"), 4);
        assert_eq!(estimate_tokens("abc"), 0);
    }
}
