//! Streaming text generation. The gateway treats the model provider as an
//! opaque producer of text chunks.

use std::pin::Pin;

use anyhow::anyhow;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

pub type TextStream = Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub api_key: String,
    pub system_prompt: Option<String>,
    /// Oldest first.
    pub messages: Vec<ChatTurn>,
}

pub trait Generator: Send + Sync + 'static {
    /// Chunks arrive in order; their concatenation is the full reply.
    fn stream(&self, request: GenerationRequest) -> TextStream;
}

/// OpenAI-compatible `/chat/completions` client using server-sent events.
pub struct OpenAiGenerator {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OpenAiGenerator {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
        }
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatTurn>,
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

impl Generator for OpenAiGenerator {
    fn stream(&self, request: GenerationRequest) -> TextStream {
        let client = self.client.clone();
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let model = self.model.clone();

        Box::pin(async_stream::stream! {
            let mut messages = Vec::with_capacity(request.messages.len() + 1);
            if let Some(prompt) = request.system_prompt {
                messages.push(ChatTurn { role: Role::System, content: prompt });
            }
            messages.extend(request.messages);

            let body = CompletionRequest { model: &model, messages, stream: true };
            let response = match client
                .post(&url)
                .bearer_auth(&request.api_key)
                .json(&body)
                .send()
                .await
                .and_then(|r| r.error_for_status())
            {
                Ok(response) => response,
                Err(e) => {
                    yield Err(anyhow!("completion request failed: {}", e));
                    return;
                }
            };

            let mut byte_chunks = Box::pin(response.bytes_stream());
            let mut lines = SseLines::default();
            let mut done = false;

            while !done {
                let Some(chunk) = byte_chunks.next().await else { break };
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        yield Err(anyhow!("stream error: {}", e));
                        break;
                    }
                };

                for data in lines.push(&bytes) {
                    if data == "[DONE]" {
                        done = true;
                        break;
                    }
                    match parse_chunk(&data) {
                        Ok(Some(text)) => yield Ok(text),
                        Ok(None) => {}
                        Err(e) => yield Err(e),
                    }
                }
            }
        })
    }
}

fn parse_chunk(data: &str) -> anyhow::Result<Option<String>> {
    let chunk: CompletionChunk =
        serde_json::from_str(data).map_err(|e| anyhow!("bad completion chunk: {}", e))?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|text| !text.is_empty()))
}

/// Splits a byte stream into SSE `data:` payloads, tolerating lines split across chunks.
#[derive(Default)]
struct SseLines {
    buffer: Vec<u8>,
}

impl SseLines {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let Ok(line) = std::str::from_utf8(&line) else {
                continue;
            };
            if let Some(data) = line.trim().strip_prefix("data:") {
                out.push(data.trim_start().to_string());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_lines_survive_chunk_splits() {
        let mut lines = SseLines::default();
        assert!(lines.push(b"data: {\"choices\":[{\"delta\":{\"con").is_empty());
        let out = lines.push(b"tent\":\"Hi\"}}]}\n\n: keepalive\ndata: [DONE]\n");
        assert_eq!(out.len(), 2);
        assert_eq!(parse_chunk(&out[0]).unwrap(), Some("Hi".to_string()));
        assert_eq!(out[1], "[DONE]");
    }

    #[test]
    fn role_only_chunks_yield_nothing() {
        let chunk = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_chunk(chunk).unwrap(), None);
        assert!(parse_chunk("{oops").is_err());
    }

    #[test]
    fn turns_serialize_with_lowercase_roles() {
        let turn = ChatTurn { role: Role::Assistant, content: "ok".into() };
        let json = serde_json::to_value(&turn).unwrap();
        assert_eq!(json["role"], "assistant");
    }
}
