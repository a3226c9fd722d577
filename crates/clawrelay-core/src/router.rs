use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::NewMessage;

static INTERNAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<internal>.*?</internal>").expect("valid internal-block regex"));

/// Build the anchored, case-insensitive trigger matcher for a registration.
/// A word boundary follows the trigger when it ends in a word character, so
/// "@Andy" matches "@andy hello" but not "@Andyman".
pub fn trigger_regex(trigger: &str) -> Option<Regex> {
    let trigger = trigger.trim();
    if trigger.is_empty() {
        return None;
    }
    let boundary = match trigger.chars().last() {
        Some(c) if c.is_alphanumeric() || c == '_' => r"\b",
        _ => "",
    };
    Regex::new(&format!(r"(?i)^{}{}", regex::escape(trigger), boundary)).ok()
}

pub fn has_trigger(content: &str, trigger: &str) -> bool {
    trigger_regex(trigger)
        .map(|re| re.is_match(content.trim_start()))
        .unwrap_or(false)
}

/// A trigger anywhere in the batch dispatches the whole batch.
pub fn batch_has_trigger(messages: &[NewMessage], trigger: &str) -> bool {
    let Some(re) = trigger_regex(trigger) else {
        return false;
    };
    messages.iter().any(|m| re.is_match(m.content.trim_start()))
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Render a batch as the agent prompt.
pub fn format_messages(messages: &[NewMessage]) -> String {
    let lines: Vec<String> = messages
        .iter()
        .map(|m| {
            format!(
                "<message sender=\"{}\" time=\"{}\">{}</message>",
                escape_xml(&m.sender_name),
                escape_xml(&m.timestamp),
                escape_xml(&m.content)
            )
        })
        .collect();
    format!("<messages>\n{}\n</messages>", lines.join("\n"))
}

pub fn strip_internal(text: &str) -> String {
    INTERNAL_RE.replace_all(text, "").trim().to_string()
}

/// Text to relay for an agent result, or None when nothing user-visible remains.
pub fn format_outbound(text: &str) -> Option<String> {
    let cleaned = strip_internal(text);
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}
