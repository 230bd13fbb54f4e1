use std::sync::Arc;

use crate::error::ChatError;
use crate::llm::{build_messages, AnswerGenerator, AnswerStream};
use crate::orchestrator::RetrievalOrchestrator;
use crate::{ChatAnswer, RequestContext};

/// Retrieval followed by grounded generation.
pub struct RagChat {
    retriever: Arc<RetrievalOrchestrator>,
    generator: Arc<AnswerGenerator>,
}

impl RagChat {
    pub fn new(retriever: Arc<RetrievalOrchestrator>, generator: Arc<AnswerGenerator>) -> Self {
        Self {
            retriever,
            generator,
        }
    }

    pub async fn answer(&self, ctx: &RequestContext, question: &str) -> Result<ChatAnswer, ChatError> {
        let chunks = self.retriever.retrieve(ctx, question).await?;
        let messages = build_messages(question, &chunks);
        let answer = self.generator.generate(ctx, messages).await?;

        Ok(ChatAnswer {
            question: question.to_string(),
            answer,
            chunks,
        })
    }

    /// Retrieval errors are returned; generation errors arrive in the stream.
    pub async fn stream_answer(
        &self,
        ctx: &RequestContext,
        question: &str,
    ) -> Result<AnswerStream, ChatError> {
        let chunks = self.retriever.retrieve(ctx, question).await?;
        tracing::debug!(trace_id = %ctx.trace_id, chunks = chunks.len(), "streaming grounded answer");
        Ok(self.generator.stream(ctx, build_messages(question, &chunks)))
    }
}
