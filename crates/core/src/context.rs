use uuid::Uuid;

/// Per-request context threaded through the subsystems so logs, audit
/// entries and events from one call correlate.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub api_key_id: Option<String>,
    pub session_id: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            api_key_id: None,
            session_id: None,
        }
    }

    pub fn with_api_key(mut self, api_key_id: &str) -> Self {
        self.api_key_id = Some(api_key_id.to_string());
        self
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    /// Actor string for audit records: the key id when authenticated,
    /// "system" otherwise.
    pub fn actor(&self) -> &str {
        self.api_key_id.as_deref().unwrap_or("system")
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
