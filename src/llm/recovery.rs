//! Conversation rewrites used to recover from endpoint rejections.
//!
//! Both rewrites are deterministic and only ever applied to a copy of the
//! history owned by the tool loop.

use super::client::{ChatMessage, Role};
use crate::util::cap_chars;
use regex::{Captures, Regex};
use std::borrow::Cow;
use std::sync::LazyLock;

/// Tool results are cut to this many characters when the request is too large.
pub const COMPRESSED_TOOL_RESULT_CHARS: usize = 500;

/// Words that commonly trip content filters in build output, and their
/// neutral stand-ins. None of the stand-ins is itself a trigger.
const SUBSTITUTIONS: &[(&str, &str)] = &[
    ("killed", "ended"),
    ("kill", "end"),
    ("panicked", "crashed"),
    ("panic", "crash"),
    ("fatal", "critical"),
    ("aborted", "halted"),
    ("abort", "halt"),
    ("exploit", "issue"),
    ("attack", "request"),
    ("die", "exit"),
    ("dead", "inactive"),
];

static TRIGGER_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    let alternation = SUBSTITUTIONS
        .iter()
        .map(|(word, _)| *word)
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternation)).expect("trigger word regex")
});

/// Truncate every tool-role message to `cap` characters.
///
/// Returns how many messages were shortened. Never grows a message, and a
/// second pass over the same history changes nothing.
pub fn compress_history(messages: &mut [ChatMessage], cap: usize) -> usize {
    let mut compressed = 0;
    for msg in messages.iter_mut().filter(|m| m.role == Role::Tool) {
        if let Some(content) = msg.content.as_mut() {
            if content.chars().count() > cap {
                *content = cap_chars(content, cap);
                compressed += 1;
            }
        }
    }
    compressed
}

/// Rewrite trigger words in system, user and tool messages.
///
/// Assistant turns are left untouched. Returns how many messages changed.
pub fn sanitize_history(messages: &mut [ChatMessage]) -> usize {
    let mut changed = 0;
    for msg in messages.iter_mut().filter(|m| m.role != Role::Assistant) {
        let Some(content) = msg.content.as_mut() else {
            continue;
        };
        if let Cow::Owned(rewritten) = sanitize_text(content) {
            *content = rewritten;
            changed += 1;
        }
    }
    changed
}

/// Case-preserving whole-word substitution of filter trigger words.
///
/// Text inside ``` fenced blocks is kept verbatim. Input with no trigger
/// word is returned borrowed.
pub fn sanitize_text(text: &str) -> Cow<'_, str> {
    if !TRIGGER_WORDS.is_match(text) {
        return Cow::Borrowed(text);
    }

    let mut out = String::with_capacity(text.len());
    let mut in_fence = false;
    for line in text.split_inclusive('\n') {
        let is_fence_marker = line.trim_start().starts_with("```");
        if in_fence || is_fence_marker {
            out.push_str(line);
        } else {
            out.push_str(&TRIGGER_WORDS.replace_all(line, |caps: &Captures| {
                substitute(&caps[0])
            }));
        }
        if is_fence_marker {
            in_fence = !in_fence;
        }
    }

    if out == text {
        Cow::Borrowed(text)
    } else {
        Cow::Owned(out)
    }
}

fn substitute(word: &str) -> String {
    let lower = word.to_lowercase();
    let replacement = SUBSTITUTIONS
        .iter()
        .find(|(trigger, _)| *trigger == lower)
        .map(|(_, replacement)| *replacement)
        .unwrap_or(word);

    if word.chars().all(|c| !c.is_alphabetic() || c.is_uppercase()) {
        replacement.to_uppercase()
    } else if word.chars().next().is_some_and(char::is_uppercase) {
        let mut chars = replacement.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    } else {
        replacement.to_string()
    }
}
