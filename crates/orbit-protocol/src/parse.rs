use serde_json::{Map, Value};

use crate::frame::ParsedFrame;

/// Parse and classify a raw text frame. Returns `None` only when the frame
/// is not valid JSON or not a JSON object — the caller still forwards such
/// frames verbatim, just without routing metadata (spec.md §4.1).
pub fn parse_frame(raw: &str) -> Option<ParsedFrame> {
    let value: Value = serde_json::from_str(raw).ok()?;
    classify(value)
}

fn classify(value: Value) -> Option<ParsedFrame> {
    let obj = value.as_object()?;

    let control_type = obj
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let method = obj
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let request_key = obj.get("id").and_then(candidate_to_key);
    let thread_id = extract_thread_id(obj);
    let anchor_id = extract_anchor_id(obj);

    Some(ParsedFrame {
        raw: value.clone(),
        control_type,
        method,
        request_key,
        thread_id,
        anchor_id,
    })
}

/// Stringify a JSON number only if it's an integer — `isinstance(x, int)` in
/// the Python original rejects floats, so `4.5` must not become `"4.5"`.
fn integer_to_string(n: &serde_json::Number) -> Option<String> {
    n.as_i64().map(|v| v.to_string()).or_else(|| n.as_u64().map(|v| v.to_string()))
}

/// `id` accepts a trimmed non-empty string or an integer; its routing key
/// is always the decimal string form (spec.md §4.1).
fn candidate_to_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_owned())
        }
        Value::Number(n) => integer_to_string(n),
        _ => None,
    }
}

/// A string (trimmed non-empty) or integer (stringified) candidate;
/// booleans and everything else are rejected, matching the Python
/// original's `isinstance` guards.
fn candidate_to_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_owned())
        }
        Value::Number(n) => integer_to_string(n),
        _ => None,
    }
}

fn nested_record<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a Map<String, Value>> {
    obj.get(key).and_then(Value::as_object)
}

/// Priority order from spec.md §4.1: `params.threadId`, `params.thread_id`,
/// `result.threadId`, `result.thread_id`, `params.thread.id`,
/// `result.thread.id`, then `params.item.threadId`/`thread_id`.
pub fn extract_thread_id(message: &Map<String, Value>) -> Option<String> {
    let params = nested_record(message, "params");
    let result = nested_record(message, "result");
    let thread_from_params = params.and_then(|p| nested_record(p, "thread"));
    let thread_from_result = result.and_then(|r| nested_record(r, "thread"));
    let item_from_params = params.and_then(|p| nested_record(p, "item"));

    let candidates = [
        params.and_then(|p| p.get("threadId")),
        params.and_then(|p| p.get("thread_id")),
        result.and_then(|r| r.get("threadId")),
        result.and_then(|r| r.get("thread_id")),
        thread_from_params.and_then(|t| t.get("id")),
        thread_from_result.and_then(|t| t.get("id")),
        item_from_params.and_then(|i| i.get("threadId")),
        item_from_params.and_then(|i| i.get("thread_id")),
    ];

    candidates.into_iter().find_map(candidate_to_string)
}

/// Priority order from spec.md §4.1: `params.anchorId`, `params.anchor_id`,
/// `result.anchorId`, `result.anchor_id`, `params.anchor.id`,
/// `result.anchor.id`.
pub fn extract_anchor_id(message: &Map<String, Value>) -> Option<String> {
    let params = nested_record(message, "params");
    let result = nested_record(message, "result");
    let anchor_from_params = params.and_then(|p| nested_record(p, "anchor"));
    let anchor_from_result = result.and_then(|r| nested_record(r, "anchor"));

    let candidates = [
        params.and_then(|p| p.get("anchorId")),
        params.and_then(|p| p.get("anchor_id")),
        result.and_then(|r| r.get("anchorId")),
        result.and_then(|r| r.get("anchor_id")),
        anchor_from_params.and_then(|a| a.get("id")),
        anchor_from_result.and_then(|a| a.get("id")),
    ];

    candidates.into_iter().find_map(candidate_to_string)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn parses_control_frame() {
        let parsed = parse_frame(r#"{"type":"ping"}"#).expect("parses");
        assert_eq!(parsed.control_type.as_deref(), Some("ping"));
        assert!(!parsed.has_method());
        assert!(!parsed.has_request_key());
    }

    #[test]
    fn parses_rpc_request() {
        let parsed = parse_frame(r#"{"id":900,"method":"thread/start","params":{"anchorId":"a1"}}"#)
            .expect("parses");
        assert_eq!(parsed.request_key.as_deref(), Some("900"));
        assert_eq!(parsed.method.as_deref(), Some("thread/start"));
        assert!(!parsed.is_response());
        assert_eq!(parsed.anchor_id.as_deref(), Some("a1"));
    }

    #[test]
    fn parses_rpc_response_as_response() {
        let parsed = parse_frame(r#"{"id":"900","result":{"thread":{"id":"T"}}}"#).expect("parses");
        assert!(parsed.is_response());
        assert_eq!(parsed.thread_id.as_deref(), Some("T"));
    }

    #[test]
    fn rejects_non_object_frame() {
        assert!(parse_frame("42").is_none());
        assert!(parse_frame("[1,2,3]").is_none());
        assert!(parse_frame("not json").is_none());
    }

    #[test]
    fn blank_id_string_has_no_request_key() {
        let parsed = parse_frame(r#"{"id":"   ","method":"ping"}"#).expect("parses");
        assert_eq!(parsed.request_key, None);
    }

    #[test]
    fn thread_id_priority_prefers_params_over_result() {
        let message = obj(json!({
            "params": {"threadId": "from-params"},
            "result": {"threadId": "from-result"},
        }));
        assert_eq!(extract_thread_id(&message).as_deref(), Some("from-params"));
    }

    #[test]
    fn thread_id_falls_back_to_nested_thread_object() {
        let message = obj(json!({"params": {"thread": {"id": "nested"}}}));
        assert_eq!(extract_thread_id(&message).as_deref(), Some("nested"));
    }

    #[test]
    fn thread_id_falls_back_to_item_fields() {
        let message = obj(json!({"params": {"item": {"threadId": "from-item"}}}));
        assert_eq!(extract_thread_id(&message).as_deref(), Some("from-item"));
    }

    #[test]
    fn thread_id_rejects_boolean() {
        let message = obj(json!({"params": {"threadId": true}}));
        assert_eq!(extract_thread_id(&message), None);
    }

    #[test]
    fn thread_id_accepts_integer_as_stringified() {
        let message = obj(json!({"params": {"threadId": 42}}));
        assert_eq!(extract_thread_id(&message).as_deref(), Some("42"));
    }

    #[test]
    fn anchor_id_priority_and_nesting() {
        let message = obj(json!({"result": {"anchor": {"id": "nested-anchor"}}}));
        assert_eq!(extract_anchor_id(&message).as_deref(), Some("nested-anchor"));
    }
}
