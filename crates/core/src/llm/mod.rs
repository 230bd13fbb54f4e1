//! Answer generation against an OpenAI-compatible chat endpoint.
//!
//! Blocking generation retries with exponential backoff and raises once the
//! attempts run out. Streaming makes a single attempt and reports failure in
//! band: the consumer always sees a final error fragment instead of an error.

pub mod openai;
pub mod prompt;

use async_trait::async_trait;
use futures_util::stream::{Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::config::{LlmEndpoint, LlmSettings};
use crate::error::{LlmError, UpstreamError};
use crate::{ChatMessage, RequestContext};

pub use openai::OpenAiBackend;
pub use prompt::{build_messages, SYSTEM_PROMPT};

pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, UpstreamError>> + Send>>;

const STREAM_BUFFER: usize = 16;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub stream: bool,
}

/// Transport to a chat-completion service.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(
        &self,
        endpoint: &LlmEndpoint,
        request: &CompletionRequest,
    ) -> Result<String, UpstreamError>;

    async fn stream(
        &self,
        endpoint: &LlmEndpoint,
        request: &CompletionRequest,
    ) -> Result<FragmentStream, UpstreamError>;
}

/// Sleep before retry number `attempt + 1`: `base * 2^attempt`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

/// In-band text sent to a stream consumer when generation fails.
pub fn error_fragment(error: &LlmError) -> String {
    format!("\n[error {}] {}", error.code(), error)
}

pub struct AnswerGenerator {
    backend: Arc<dyn ChatBackend>,
    settings: LlmSettings,
}

impl AnswerGenerator {
    pub fn new(backend: Arc<dyn ChatBackend>, settings: LlmSettings) -> Self {
        Self { backend, settings }
    }

    pub fn settings(&self) -> &LlmSettings {
        &self.settings
    }

    fn request(&self, endpoint: &LlmEndpoint, messages: Vec<ChatMessage>, stream: bool) -> CompletionRequest {
        CompletionRequest {
            model: endpoint.model.clone(),
            messages,
            temperature: self.settings.temperature,
            stream,
        }
    }

    /// Generates a full answer, retrying transient failures.
    ///
    /// Configuration problems fail before the first attempt.
    pub async fn generate(
        &self,
        ctx: &RequestContext,
        messages: Vec<ChatMessage>,
    ) -> Result<String, LlmError> {
        let endpoint = self.settings.endpoint()?;
        let request = self.request(&endpoint, messages, false);
        let max_attempts = self.settings.max_retries.saturating_add(1);
        let timeout = self.settings.request_timeout;

        let span = tracing::info_span!("generate", trace_id = %ctx.trace_id, model = %endpoint.model);
        async move {
            let mut attempt = 0u32;
            loop {
                let result = match tokio::time::timeout(timeout, self.backend.complete(&endpoint, &request)).await {
                    Ok(result) => result,
                    Err(_) => Err(UpstreamError::Timeout(timeout)),
                };

                match result {
                    Ok(answer) => {
                        tracing::debug!(attempts = attempt + 1, chars = answer.len(), "answer generated");
                        return Ok(answer);
                    }
                    Err(error) if attempt + 1 < max_attempts => {
                        let delay = backoff_delay(self.settings.base_delay, attempt);
                        tracing::warn!(
                            attempt = attempt + 1,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "language model call failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(error) => {
                        tracing::error!(attempts = max_attempts, error = %error, "language model call failed");
                        return Err(LlmError::Upstream {
                            attempts: max_attempts,
                            source: error,
                        });
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Streams answer fragments from a background producer.
    ///
    /// Dropping the returned stream closes the channel; the producer notices
    /// before pulling the next fragment and stops calling the upstream.
    pub fn stream(&self, ctx: &RequestContext, messages: Vec<ChatMessage>) -> AnswerStream {
        let (sender, receiver) = mpsc::channel(STREAM_BUFFER);
        let backend = self.backend.clone();
        let settings = self.settings.clone();
        let span = tracing::info_span!("stream_answer", trace_id = %ctx.trace_id);

        tokio::spawn(produce(backend, settings, messages, sender).instrument(span));
        AnswerStream { receiver }
    }
}

async fn produce(
    backend: Arc<dyn ChatBackend>,
    settings: LlmSettings,
    messages: Vec<ChatMessage>,
    sender: mpsc::Sender<String>,
) {
    if let Err(error) = forward(backend.as_ref(), &settings, messages, &sender).await {
        tracing::warn!(code = error.code(), error = %error, "answer stream failed");
        let _ = sender.send(error_fragment(&error)).await;
    }
}

async fn forward(
    backend: &dyn ChatBackend,
    settings: &LlmSettings,
    messages: Vec<ChatMessage>,
    sender: &mpsc::Sender<String>,
) -> Result<(), LlmError> {
    let upstream = |source| LlmError::Upstream {
        attempts: 1,
        source,
    };

    let endpoint = settings.endpoint()?;
    let request = CompletionRequest {
        model: endpoint.model.clone(),
        messages,
        temperature: settings.temperature,
        stream: true,
    };

    let timeout = settings.request_timeout;
    let mut fragments = tokio::time::timeout(timeout, backend.stream(&endpoint, &request))
        .await
        .unwrap_or(Err(UpstreamError::Timeout(timeout)))
        .map_err(upstream)?;

    let mut delivered = 0usize;
    loop {
        if sender.is_closed() {
            tracing::debug!(delivered, "consumer went away, stopping stream");
            return Ok(());
        }

        let next = tokio::time::timeout(timeout, fragments.next())
            .await
            .map_err(|_| upstream(UpstreamError::Timeout(timeout)))?;
        let Some(fragment) = next else {
            tracing::debug!(delivered, "answer stream finished");
            return Ok(());
        };
        let fragment = fragment.map_err(upstream)?;
        if sender.send(fragment).await.is_err() {
            return Ok(());
        }
        delivered += 1;
    }
}

/// Receiving end of a streamed answer. Ends after the upstream finishes or
/// after a single error fragment.
pub struct AnswerStream {
    receiver: mpsc::Receiver<String>,
}

impl AnswerStream {
    pub async fn next_fragment(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

impl Stream for AnswerStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.receiver.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` calls, then answers. Streams `fragments`,
    /// optionally breaking after `break_after` of them.
    #[derive(Default)]
    struct ScriptedBackend {
        failures: usize,
        calls: AtomicUsize,
        fragments: Vec<&'static str>,
        break_after: Option<usize>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn complete(
            &self,
            _endpoint: &LlmEndpoint,
            request: &CompletionRequest,
        ) -> Result<String, UpstreamError> {
            self.requests.lock().push(request.clone());
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(UpstreamError::Status {
                    status: 503,
                    body: format!("overloaded #{call}"),
                });
            }
            Ok("Replace the seal.".to_string())
        }

        async fn stream(
            &self,
            _endpoint: &LlmEndpoint,
            request: &CompletionRequest,
        ) -> Result<FragmentStream, UpstreamError> {
            self.requests.lock().push(request.clone());
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures > 0 {
                return Err(UpstreamError::Status {
                    status: 500,
                    body: "down".to_string(),
                });
            }

            let mut items: Vec<Result<String, UpstreamError>> =
                self.fragments.iter().map(|f| Ok(f.to_string())).collect();
            if let Some(limit) = self.break_after {
                items.truncate(limit);
                items.push(Err(UpstreamError::Malformed("connection reset".to_string())));
                items.push(Ok("never delivered".to_string()));
            }
            Ok(Box::pin(futures_util::stream::iter(items)))
        }
    }

    /// The first blocking call hangs. Streams yield numbered fragments every
    /// 10ms forever, or stall after the first one.
    #[derive(Default)]
    struct SlowBackend {
        calls: AtomicUsize,
        pulled: Arc<AtomicUsize>,
        stall_after_first: bool,
    }

    #[async_trait]
    impl ChatBackend for SlowBackend {
        async fn complete(
            &self,
            _endpoint: &LlmEndpoint,
            _request: &CompletionRequest,
        ) -> Result<String, UpstreamError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok("Replace the seal.".to_string())
        }

        async fn stream(
            &self,
            _endpoint: &LlmEndpoint,
            _request: &CompletionRequest,
        ) -> Result<FragmentStream, UpstreamError> {
            let pulled = self.pulled.clone();
            let stall = self.stall_after_first;
            Ok(Box::pin(futures_util::stream::unfold(0usize, move |n| {
                let pulled = pulled.clone();
                async move {
                    if stall && n == 1 {
                        std::future::pending::<()>().await;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    pulled.fetch_add(1, Ordering::SeqCst);
                    Some((Ok(format!("token{n} ")), n + 1))
                }
            })))
        }
    }

    fn settings(max_retries: u32) -> LlmSettings {
        LlmSettings {
            api_key: Some("sk-test".into()),
            base_url: Some("http://localhost:9/v1".into()),
            model: Some("chat-model".into()),
            max_retries,
            base_delay: Duration::from_millis(100),
            ..LlmSettings::default()
        }
    }

    fn question() -> Vec<ChatMessage> {
        vec![ChatMessage::user("How do I stop the leak?")]
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(800);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(800));
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(1600));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(6400));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let backend = Arc::new(ScriptedBackend {
            failures: 2,
            ..ScriptedBackend::default()
        });
        let generator = AnswerGenerator::new(backend.clone(), settings(3));

        let started = tokio::time::Instant::now();
        let answer = generator.generate(&RequestContext::new(), question()).await.unwrap();

        assert_eq!(answer, "Replace the seal.");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        // two backoff sleeps: 100ms then 200ms
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(300) && waited < Duration::from_millis(400));

        let requests = backend.requests.lock();
        assert_eq!(requests[0].model, "chat-model");
        assert!(!requests[0].stream);
        assert!((requests[0].temperature - 0.2).abs() < f32::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_the_last_error() {
        let backend = Arc::new(ScriptedBackend {
            failures: usize::MAX,
            ..ScriptedBackend::default()
        });
        let generator = AnswerGenerator::new(backend.clone(), settings(2));

        let error = generator
            .generate(&RequestContext::new(), question())
            .await
            .unwrap_err();

        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        match error {
            LlmError::Upstream { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(source.to_string().contains("overloaded #2"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_configuration_fails_without_calling_upstream() {
        let backend = Arc::new(ScriptedBackend::default());
        let generator = AnswerGenerator::new(
            backend.clone(),
            LlmSettings {
                api_key: None,
                ..settings(3)
            },
        );

        let error = generator
            .generate(&RequestContext::new(), question())
            .await
            .unwrap_err();
        assert!(matches!(error, LlmError::Configuration(_)));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stream_delivers_fragments_in_order() {
        let backend = Arc::new(ScriptedBackend {
            fragments: vec!["Replace ", "the ", "seal."],
            ..ScriptedBackend::default()
        });
        let generator = AnswerGenerator::new(backend.clone(), settings(3));

        let fragments: Vec<String> = generator
            .stream(&RequestContext::new(), question())
            .collect()
            .await;

        assert_eq!(fragments, vec!["Replace ", "the ", "seal."]);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert!(backend.requests.lock()[0].stream);
    }

    #[tokio::test]
    async fn mid_stream_failure_yields_one_error_fragment_then_ends() {
        let backend = Arc::new(ScriptedBackend {
            fragments: vec!["Replace ", "the ", "seal."],
            break_after: Some(2),
            ..ScriptedBackend::default()
        });
        let generator = AnswerGenerator::new(backend, settings(3));

        let mut stream = generator.stream(&RequestContext::new(), question());
        assert_eq!(stream.next_fragment().await.as_deref(), Some("Replace "));
        assert_eq!(stream.next_fragment().await.as_deref(), Some("the "));
        let error = stream.next_fragment().await.unwrap();
        assert!(error.contains("LLM_UPSTREAM_ERROR"));
        assert!(error.contains("connection reset"));
        assert_eq!(stream.next_fragment().await, None);
    }

    #[tokio::test]
    async fn streaming_is_a_single_attempt() {
        let backend = Arc::new(ScriptedBackend {
            failures: 1,
            ..ScriptedBackend::default()
        });
        let generator = AnswerGenerator::new(backend.clone(), settings(3));

        let fragments: Vec<String> = generator
            .stream(&RequestContext::new(), question())
            .collect()
            .await;

        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].contains("LLM_UPSTREAM_ERROR"));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stream_configuration_errors_are_reported_in_band() {
        let backend = Arc::new(ScriptedBackend::default());
        let generator = AnswerGenerator::new(
            backend.clone(),
            LlmSettings {
                model: None,
                ..settings(3)
            },
        );

        let fragments: Vec<String> = generator
            .stream(&RequestContext::new(), question())
            .collect()
            .await;

        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].contains("LLM_CONFIGURATION_ERROR"));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_attempts_are_retried() {
        let backend = Arc::new(SlowBackend::default());
        let generator = AnswerGenerator::new(
            backend.clone(),
            LlmSettings {
                request_timeout: Duration::from_secs(1),
                ..settings(2)
            },
        );

        let started = tokio::time::Instant::now();
        let answer = generator.generate(&RequestContext::new(), question()).await.unwrap();

        assert_eq!(answer, "Replace the seal.");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        // one timeout, then one 100ms backoff
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(1100) && waited < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_stream_stops_upstream_pulls() {
        let backend = Arc::new(SlowBackend::default());
        let generator = AnswerGenerator::new(backend.clone(), settings(3));

        let mut stream = generator.stream(&RequestContext::new(), question());
        for n in 0..3 {
            assert_eq!(stream.next_fragment().await, Some(format!("token{n} ")));
        }
        drop(stream);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let after_drop = backend.pulled.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(backend.pulled.load(Ordering::SeqCst), after_drop);
        assert!(after_drop <= 3 + STREAM_BUFFER + 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_stream_times_out_in_band() {
        let backend = Arc::new(SlowBackend {
            stall_after_first: true,
            ..SlowBackend::default()
        });
        let generator = AnswerGenerator::new(
            backend,
            LlmSettings {
                request_timeout: Duration::from_secs(5),
                ..settings(3)
            },
        );

        let fragments: Vec<String> = generator
            .stream(&RequestContext::new(), question())
            .collect()
            .await;

        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0], "token0 ");
        assert!(fragments[1].starts_with("\n[error LLM_UPSTREAM_ERROR]"));
    }
}
