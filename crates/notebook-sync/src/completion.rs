//! Completion bridge: forwards editor completion requests to the server and
//! time-boxes the answer.
//!
//! The server tokenizes differently than any client could, so the
//! replacement span it returns is applied verbatim, never recomputed.

use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::api::ApiClient;

/// Completion candidates and the span (character offsets) they replace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    #[serde(default)]
    pub matches: Vec<String>,
    #[serde(default)]
    pub cursor_start: usize,
    #[serde(default)]
    pub cursor_end: usize,
}

impl Completion {
    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    /// Replace `[cursor_start, cursor_end)` in `source` with `choice`.
    /// Returns the new text and the cursor offset (in characters) after the
    /// inserted text. Offsets past the end of `source` are clamped.
    pub fn apply(&self, source: &str, choice: &str) -> (String, usize) {
        let char_count = source.chars().count();
        let start = self.cursor_start.min(char_count);
        let end = self.cursor_end.clamp(start, char_count);
        let start_byte = byte_offset(source, start);
        let end_byte = byte_offset(source, end);

        let mut text = String::with_capacity(source.len() + choice.len());
        text.push_str(&source[..start_byte]);
        text.push_str(choice);
        text.push_str(&source[end_byte..]);
        (text, start + choice.chars().count())
    }
}

fn byte_offset(text: &str, char_index: usize) -> usize {
    text.char_indices()
        .nth(char_index)
        .map(|(i, _)| i)
        .unwrap_or(text.len())
}

/// Decide whether a completion should be requested at `cursor_pos`.
///
/// Explicit invocations always trigger. Otherwise at least `min_prefix`
/// identifier characters, or a `.`, must sit right before the cursor.
pub fn should_trigger(source: &str, cursor_pos: usize, min_prefix: usize, explicit: bool) -> bool {
    if explicit {
        return true;
    }
    let before: Vec<char> = source.chars().take(cursor_pos).collect();
    if before.last() == Some(&'.') {
        return true;
    }
    let prefix_len = before
        .iter()
        .rev()
        .take_while(|c| c.is_alphanumeric() || **c == '_')
        .count();
    min_prefix > 0 && prefix_len >= min_prefix
}

/// Sends completion requests through the REST client with a hard timeout.
#[derive(Debug, Clone)]
pub struct CompletionBridge {
    api: ApiClient,
    timeout: Duration,
}

impl CompletionBridge {
    pub fn new(api: ApiClient, timeout: Duration) -> Self {
        Self { api, timeout }
    }

    /// Ask the server for completions. Any failure, an empty answer or a
    /// timeout yields an empty [`Completion`].
    pub async fn complete(&self, code: &str, cursor_pos: usize) -> Completion {
        match tokio::time::timeout(self.timeout, self.api.complete(code, cursor_pos)).await {
            Ok(Ok(completion)) if !completion.is_empty() => completion,
            Ok(Ok(_)) => {
                debug!("[notebook-completion] No matches at {}", cursor_pos);
                Completion::default()
            }
            Ok(Err(e)) => {
                warn!("[notebook-completion] Request failed: {}", e);
                Completion::default()
            }
            Err(_) => {
                warn!(
                    "[notebook-completion] Timed out after {:?}",
                    self.timeout
                );
                Completion::default()
            }
        }
    }
}
