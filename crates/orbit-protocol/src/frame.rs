use serde_json::Value;

/// The outcome of classifying one inbound text frame (spec.md §4.1).
///
/// A frame is either a control frame (string `type` field), an RPC request
/// (`method` present), an RPC response (`id` present, no `method`), or
/// opaque (no routing metadata at all — still forwarded, never parsed
/// further).
#[derive(Debug, Clone)]
pub struct ParsedFrame {
    pub raw: Value,
    pub control_type: Option<String>,
    pub method: Option<String>,
    pub request_key: Option<String>,
    pub thread_id: Option<String>,
    pub anchor_id: Option<String>,
}

impl ParsedFrame {
    /// A request/response pair is correlatable only once it carries an id.
    pub fn has_request_key(&self) -> bool {
        self.request_key.is_some()
    }

    pub fn has_method(&self) -> bool {
        self.method.is_some()
    }

    /// True for a frame that has an id but no method: the response half of
    /// an RPC pair (spec.md §4.4).
    pub fn is_response(&self) -> bool {
        self.has_request_key() && !self.has_method()
    }
}
