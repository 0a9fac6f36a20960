use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::constants::ROUTING_ERROR_CODE;

/// Routing-layer error taxonomy surfaced on the wire (spec.md §7).
///
/// `NoResult` and `InvalidRequest` are carried for completeness of the
/// taxonomy but are not currently raised by the routing state machine
/// itself (§4.5.3 only ever produces the other four).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("no anchor with that id is connected")]
    AnchorNotFound,
    #[error("the bound anchor is not connected")]
    AnchorOffline,
    #[error("more than one anchor is connected; specify anchorId")]
    AnchorRequired,
    #[error("thread is bound to a different anchor")]
    ThreadAnchorMismatch,
    #[error("no anchor responded before the timeout")]
    Timeout,
    #[error("the dispatch produced no result")]
    NoResult,
    #[error("the request was malformed")]
    InvalidRequest,
}

impl RouteError {
    /// The stable wire code in `error.data.code` (spec.md §4.7).
    pub fn code(self) -> &'static str {
        match self {
            RouteError::AnchorNotFound => "anchor_not_found",
            RouteError::AnchorOffline => "anchor_offline",
            RouteError::AnchorRequired => "anchor_required",
            RouteError::ThreadAnchorMismatch => "thread_anchor_mismatch",
            RouteError::Timeout => "timeout",
            RouteError::NoResult => "no_result",
            RouteError::InvalidRequest => "invalid_request",
        }
    }

    /// Build the full error reply frame for a known `request_id`
    /// (spec.md §4.7). `request_id` is re-emitted as given: a string stays
    /// a string, matching how ids normally round-trip on the wire.
    pub fn reply_frame(self, request_id: &Value) -> Value {
        json!({
            "id": request_id,
            "error": {
                "code": ROUTING_ERROR_CODE,
                "message": self.to_string(),
                "data": { "code": self.code() },
            }
        })
    }
}

/// A single slot of a multi-dispatch result array (spec.md §4.4 step 5).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchSlot {
    pub anchor_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl DispatchSlot {
    pub fn ok(anchor_id: impl Into<String>, response: Value) -> Self {
        Self {
            anchor_id: anchor_id.into(),
            ok: true,
            response: Some(response),
            error: None,
        }
    }

    pub fn err(anchor_id: impl Into<String>, error: RouteError) -> Self {
        Self {
            anchor_id: anchor_id.into(),
            ok: false,
            response: None,
            error: Some(json!({ "code": error.code() })),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_frame_matches_wire_shape() {
        let frame = RouteError::AnchorOffline.reply_frame(&json!(902));
        assert_eq!(frame["id"], json!(902));
        assert_eq!(frame["error"]["code"], json!(ROUTING_ERROR_CODE));
        assert_eq!(frame["error"]["data"]["code"], json!("anchor_offline"));
    }

    #[test]
    fn dispatch_slot_err_omits_response() {
        let slot = DispatchSlot::err("a", RouteError::Timeout);
        let value = serde_json::to_value(&slot).expect("serializes");
        assert!(value.get("response").is_none());
        assert_eq!(value["error"]["code"], json!("timeout"));
    }
}
