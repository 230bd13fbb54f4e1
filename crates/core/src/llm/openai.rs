use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;

use super::{ChatBackend, CompletionRequest, FragmentStream};
use crate::config::LlmEndpoint;
use crate::error::UpstreamError;

/// Chat completions over an OpenAI-compatible HTTP API.
#[derive(Clone, Default)]
pub struct OpenAiBackend {
    client: Client,
}

impl OpenAiBackend {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn send(
        &self,
        endpoint: &LlmEndpoint,
        request: &CompletionRequest,
    ) -> Result<reqwest::Response, UpstreamError> {
        let url = endpoint
            .chat_completions_url()
            .map_err(|error| UpstreamError::Malformed(format!("invalid endpoint url: {error}")))?;

        let response = self
            .client
            .post(url)
            .bearer_auth(&endpoint.api_key)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status { status, body });
        }
        Ok(response)
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

fn parse_completion(body: CompletionResponse) -> Result<String, UpstreamError> {
    body.choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .ok_or_else(|| UpstreamError::Malformed("completion has no message content".to_string()))
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    async fn complete(
        &self,
        endpoint: &LlmEndpoint,
        request: &CompletionRequest,
    ) -> Result<String, UpstreamError> {
        let response = self.send(endpoint, request).await?;
        let body: CompletionResponse = response.json().await?;
        parse_completion(body)
    }

    async fn stream(
        &self,
        endpoint: &LlmEndpoint,
        request: &CompletionRequest,
    ) -> Result<FragmentStream, UpstreamError> {
        let response = self.send(endpoint, request).await?;

        let stream = stream_lines(response.bytes_stream()).filter_map(|line| async move {
            match line {
                Ok(line) => parse_sse_line(&line),
                Err(error) => Some(Err(error)),
            }
        });
        Ok(Box::pin(stream))
    }
}

/// Parses one server-sent event line. `None` skips blank lines, comments,
/// `[DONE]` and role-only deltas.
fn parse_sse_line(line: &str) -> Option<Result<String, UpstreamError>> {
    let data = line.trim().strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .filter(|content| !content.is_empty())
            .map(Ok),
        Err(error) => Some(Err(UpstreamError::Malformed(format!(
            "unreadable stream chunk: {error}"
        )))),
    }
}

/// Re-frames a byte stream into complete lines. Bytes are buffered until a
/// newline arrives, so characters split across network chunks decode intact.
fn stream_lines(
    byte_stream: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
) -> impl Stream<Item = Result<String, UpstreamError>> + Send {
    futures_util::stream::unfold(
        (Box::pin(byte_stream), Vec::<u8>::new(), false),
        |(mut stream, mut buffer, done)| async move {
            if done {
                return None;
            }
            loop {
                if let Some(newline) = buffer.iter().position(|byte| *byte == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=newline).collect();
                    let line = String::from_utf8_lossy(&line[..newline]).into_owned();
                    if !line.trim().is_empty() {
                        return Some((Ok(line), (stream, buffer, false)));
                    }
                    continue;
                }

                match stream.next().await {
                    Some(Ok(bytes)) => buffer.extend_from_slice(&bytes),
                    Some(Err(error)) => {
                        return Some((Err(UpstreamError::Http(error)), (stream, buffer, true)));
                    }
                    None => {
                        let rest = String::from_utf8_lossy(&buffer).into_owned();
                        if rest.trim().is_empty() {
                            return None;
                        }
                        buffer.clear();
                        return Some((Ok(rest), (stream, buffer, true)));
                    }
                }
            }
        },
    )
}
