use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;

/// Finite, non-restartable sequence of generated text chunks.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<TextStream>;
}

#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: Option<String>,
    model: String,
    system_prompt: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: Option<String>, model: String) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            model,
            system_prompt: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        self.system_prompt = (!prompt.trim().is_empty()).then_some(prompt);
        self
    }

    /// Open a streaming chat completion and return its text deltas.
    pub async fn stream_chat(&self, messages: Vec<Message>) -> Result<TextStream> {
        let url = format!("{}/chat/completions", self.api_url);

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: Some(0.7),
            max_tokens: Some(400),
            stream: true,
        };

        let mut req = self.client.post(&url).json(&request);

        // Add API key header if provided (not needed for local models)
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req
            .send()
            .await
            .context("Failed to send streaming LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Streaming LLM API error {}: {}", status, body);
        }

        let state = StreamState {
            response,
            lines: LineDecoder::default(),
        };
        Ok(Box::pin(futures_util::stream::try_unfold(
            state,
            next_stream_chunk,
        )))
    }
}

#[async_trait]
impl TextGenerator for LlmClient {
    async fn generate(&self, prompt: &str) -> Result<TextStream> {
        let mut messages = Vec::with_capacity(2);
        if let Some(ref system) = self.system_prompt {
            messages.push(Message {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.push(Message {
            role: "user".to_string(),
            content: prompt.to_string(),
        });
        self.stream_chat(messages).await
    }
}

struct StreamState {
    response: reqwest::Response,
    lines: LineDecoder,
}

/// Splits raw body bytes into lines; a line is only decoded once it is complete,
/// so multi-byte characters may straddle network chunks.
#[derive(Default)]
struct LineDecoder {
    buffer: Vec<u8>,
    queued: VecDeque<String>,
    finished: bool,
}

impl LineDecoder {
    fn push_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(bytes);
        while let Some(newline_idx) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.drain(..=newline_idx).collect::<Vec<u8>>();
            self.accept_line(&line[..newline_idx])?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let rest = std::mem::take(&mut self.buffer);
        self.accept_line(&rest)?;
        self.finished = true;
        Ok(())
    }

    fn accept_line(&mut self, line: &[u8]) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        match parse_stream_line(&String::from_utf8_lossy(line))? {
            StreamLine::Delta(text) => {
                if !text.is_empty() {
                    self.queued.push_back(text);
                }
            }
            StreamLine::Done => self.finished = true,
            StreamLine::Skip => {}
        }
        Ok(())
    }
}

async fn next_stream_chunk(mut state: StreamState) -> Result<Option<(String, StreamState)>> {
    loop {
        if let Some(text) = state.lines.queued.pop_front() {
            return Ok(Some((text, state)));
        }
        if state.lines.finished {
            return Ok(None);
        }

        match state
            .response
            .chunk()
            .await
            .context("Failed reading streaming chunk")?
        {
            Some(bytes) => state.lines.push_bytes(&bytes)?,
            None => state.lines.finish()?,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum StreamLine {
    Delta(String),
    Done,
    Skip,
}

/// One line of an SSE (`data: {...}`) or NDJSON streaming body.
fn parse_stream_line(line: &str) -> Result<StreamLine> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return Ok(StreamLine::Skip);
    }

    let payload = match line.strip_prefix("data:") {
        Some(rest) => rest.trim(),
        None if line.starts_with('{') => line,
        None => return Ok(StreamLine::Skip),
    };
    if payload == "[DONE]" {
        return Ok(StreamLine::Done);
    }

    let chunk_json: serde_json::Value = serde_json::from_str(payload)
        .with_context(|| format!("Failed to parse stream payload: {}", payload))?;

    if let Some(error) = chunk_json.get("error") {
        anyhow::bail!("LLM stream reported error: {}", error);
    }

    if let Some(choice) = chunk_json["choices"].as_array().and_then(|arr| arr.first()) {
        if let Some(delta_content) = choice["delta"]["content"].as_str() {
            return Ok(StreamLine::Delta(delta_content.to_string()));
        }
        if let Some(content) = choice["message"]["content"].as_str() {
            return Ok(StreamLine::Delta(content.to_string()));
        }
        return Ok(StreamLine::Skip);
    }

    // Ollama native /api/generate framing
    if let Some(text) = chunk_json["response"].as_str() {
        if text.is_empty() && chunk_json["done"].as_bool() == Some(true) {
            return Ok(StreamLine::Done);
        }
        return Ok(StreamLine::Delta(text.to_string()));
    }

    Ok(StreamLine::Skip)
}
