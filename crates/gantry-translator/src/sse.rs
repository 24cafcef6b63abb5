//! SSE event parser for upstream streams
//!
//! Feeds on arbitrary byte chunks and yields framed events. Tolerant by
//! design: OpenAI-style streams only ever use `data:` lines, but `event:`,
//! `id:` and comment lines are tracked so a stricter upstream still frames
//! correctly.

/// One parsed item from the upstream stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SseItem {
    /// A `data:` payload with the event type in effect when it arrived
    Event { event: Option<String>, data: String },
    /// The `data: [DONE]` sentinel
    Done,
}

/// Hard cap on the line buffer; prevents unframed upstream data from growing
/// the buffer without bound.
const MAX_BUFFER: usize = 64 * 1024;

#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    current_event: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk of bytes; returns every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseItem> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        if self.buffer.len() > MAX_BUFFER {
            let half = self.buffer.len() / 2;
            let cut = self
                .buffer
                .char_indices()
                .map(|(i, _)| i)
                .find(|&i| i >= half)
                .unwrap_or(0);
            tracing::warn!("sse buffer exceeded {} bytes, discarding oldest half", MAX_BUFFER);
            self.buffer.drain(..cut);
        }

        let mut items = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                // Blank line terminates the current event
                self.current_event = None;
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.strip_prefix(' ').unwrap_or(data);
                if data.trim() == "[DONE]" {
                    items.push(SseItem::Done);
                } else {
                    items.push(SseItem::Event {
                        event: self.current_event.clone(),
                        data: data.to_string(),
                    });
                }
            } else if let Some(event) = line.strip_prefix("event:") {
                self.current_event = Some(event.trim().to_string());
            }
            // `id:` and `:` comment lines are tracked implicitly: ignored
        }
        items
    }
}
