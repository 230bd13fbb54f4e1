use uuid::Uuid;

/// Per-unit-of-work values threaded explicitly through indexing, retrieval and
/// generation calls. Only used to correlate log records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub trace_id: String,
}

impl RequestContext {
    /// A context with a fresh 12 hex character trace id.
    pub fn new() -> Self {
        let mut trace_id = Uuid::new_v4().simple().to_string();
        trace_id.truncate(12);
        Self { trace_id }
    }

    pub fn with_trace_id(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
        }
    }

    /// A child context for work that outlives the request, keeping the same id.
    pub fn detached(&self) -> Self {
        self.clone()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
