use crate::{ChatMessage, RetrievedChunk};

pub const SYSTEM_PROMPT: &str = "You are a question-answering assistant.\n\
Answer strictly based on the provided context.\n\
If the context does not contain the answer, say you don't know.";

/// Context blocks of the form `[Document <id>]\n<text>`, separated by a blank line.
pub fn render_context(chunks: &[RetrievedChunk]) -> String {
    chunks
        .iter()
        .map(|chunk| format!("[Document {}]\n{}", chunk.document_id, chunk.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// System instructions plus one user turn carrying the context and question.
pub fn build_messages(question: &str, chunks: &[RetrievedChunk]) -> Vec<ChatMessage> {
    let user = format!(
        "Context:\n{}\n\nQuestion:\n{}\n\nAnswer using only the information in the context.",
        render_context(chunks),
        question.trim()
    );
    vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)]
}
