use orbit_common::random_hex_128;
use orbit_storage::NewArtifact;
use serde_json::Value;

/// A turn-state update derived from a `turn/started` or `turn/completed`
/// frame. Fields are `None` when the frame did not carry them — the caller
/// merges this into existing state rather than overwriting blindly.
#[derive(Debug, Default, PartialEq)]
pub struct TurnUpdate {
    pub turn_id: Option<String>,
    pub turn_status: Option<String>,
}

impl TurnUpdate {
    pub fn is_empty(&self) -> bool {
        self.turn_id.is_none() && self.turn_status.is_none()
    }
}

/// Extract a turn update from `turn/started` / `turn/completed` params.
pub fn extract_turn_update(params: &Value) -> TurnUpdate {
    let turn = params.get("turn");
    let turn_id = turn
        .and_then(|t| t.get("id"))
        .and_then(Value::as_str)
        .or_else(|| params.get("turnId").and_then(Value::as_str))
        .map(str::to_owned);
    let turn_status = turn
        .and_then(|t| t.get("status"))
        .and_then(Value::as_str)
        .or_else(|| params.get("status").and_then(Value::as_str))
        .map(str::to_owned);
    TurnUpdate { turn_id, turn_status }
}

/// Map a recognised `item.type` to its persisted `artifact_type`. `None`
/// means the item type is not artifact-worthy and must not raise.
fn artifact_type_for(item_type: &str) -> Option<&'static str> {
    match item_type {
        "commandExecution" => Some("command"),
        "fileChange" => Some("file"),
        "imageView" => Some("image"),
        "mcpToolCall" => Some("tool"),
        "webSearch" => Some("tool"),
        "collabAgentToolCall" => Some("tool"),
        _ => None,
    }
}

fn trimmed_str(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

fn summarise(item_type: &str, item: &Value) -> String {
    match item_type {
        "commandExecution" => {
            let command = trimmed_str(item, "command");
            let exit_code = item.get("exitCode").and_then(Value::as_i64);
            match (command, exit_code) {
                (Some(cmd), Some(code)) => format!("{cmd} (exit={code})"),
                (Some(cmd), None) => cmd,
                (None, _) => "command".to_owned(),
            }
        }
        "fileChange" => {
            let paths: Vec<String> = item
                .get("paths")
                .and_then(Value::as_array)
                .map(|arr| arr.iter().filter_map(Value::as_str).take(5).map(str::to_owned).collect())
                .unwrap_or_default();
            if paths.is_empty() {
                "file change".to_owned()
            } else {
                paths.join(", ")
            }
        }
        "imageView" => ["path", "imagePath", "image_url", "imageUrl", "url"]
            .iter()
            .find_map(|key| trimmed_str(item, key))
            .unwrap_or_else(|| "image artifact".to_owned()),
        "mcpToolCall" | "collabAgentToolCall" => {
            trimmed_str(item, "tool").unwrap_or_else(|| "tool call".to_owned())
        }
        "webSearch" => trimmed_str(item, "query").unwrap_or_else(|| "web search".to_owned()),
        _ => item_type.to_owned(),
    }
}

/// Build the artifact record for an `item/completed` frame, if its item
/// type is one of the recognised artifact-worthy types. `current_turn_id`
/// is the thread state's turn id, used as the last-resort fallback.
pub fn extract_artifact(
    user_id: &str,
    thread_id: &str,
    params: &Value,
    current_turn_id: Option<&str>,
) -> Option<NewArtifact> {
    let item = params.get("item")?;
    let item_type = item.get("type").and_then(Value::as_str)?;
    let artifact_type = artifact_type_for(item_type)?;

    let item_id = trimmed_str(item, "id").unwrap_or_else(random_hex_128);
    let turn_id = trimmed_str(params, "turnId")
        .or_else(|| trimmed_str(params, "turn_id"))
        .or_else(|| trimmed_str(item, "turnId"))
        .or_else(|| trimmed_str(item, "turn_id"))
        .or_else(|| current_turn_id.map(str::to_owned));
    let anchor_id = trimmed_str(params, "anchorId").or_else(|| trimmed_str(params, "anchor_id"));
    let summary = summarise(item_type, item);

    Some(NewArtifact {
        user_id: user_id.to_owned(),
        thread_id: thread_id.to_owned(),
        item_id,
        turn_id,
        anchor_id,
        artifact_type: artifact_type.to_owned(),
        item_type: item_type.to_owned(),
        summary,
        payload: item.clone(),
    })
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn turn_update_reads_nested_and_flat_fields() {
        let update = extract_turn_update(&json!({"turn": {"id": "t1", "status": "running"}}));
        assert_eq!(update.turn_id.as_deref(), Some("t1"));
        assert_eq!(update.turn_status.as_deref(), Some("running"));

        let flat = extract_turn_update(&json!({"turnId": "t2", "status": "done"}));
        assert_eq!(flat.turn_id.as_deref(), Some("t2"));
    }

    #[test]
    fn command_summary_includes_exit_code() {
        let params = json!({"item": {"type": "commandExecution", "id": "cmd-1", "command": "echo hi", "exitCode": 0}});
        let artifact = extract_artifact("u1", "t1", &params, None).expect("artifact");
        assert_eq!(artifact.artifact_type, "command");
        assert_eq!(artifact.summary, "echo hi (exit=0)");
        assert_eq!(artifact.item_id, "cmd-1");
    }

    #[test]
    fn unrecognised_item_type_produces_no_artifact() {
        let params = json!({"item": {"type": "somethingElse", "id": "x"}});
        assert!(extract_artifact("u1", "t1", &params, None).is_none());
    }

    #[test]
    fn missing_item_id_gets_a_fresh_one() {
        let params = json!({"item": {"type": "webSearch", "query": "rust async"}});
        let artifact = extract_artifact("u1", "t1", &params, None).expect("artifact");
        assert_eq!(artifact.item_id.len(), 32);
        assert_eq!(artifact.summary, "web search");
    }

    #[test]
    fn turn_id_falls_back_to_current_thread_state() {
        let params = json!({"item": {"type": "commandExecution", "id": "c1", "command": "ls"}});
        let artifact = extract_artifact("u1", "t1", &params, Some("t-current")).expect("artifact");
        assert_eq!(artifact.turn_id.as_deref(), Some("t-current"));
    }

    #[test]
    fn file_change_summary_joins_paths() {
        let params = json!({"item": {"type": "fileChange", "id": "f1", "paths": ["a.rs", "b.rs"]}});
        let artifact = extract_artifact("u1", "t1", &params, None).expect("artifact");
        assert_eq!(artifact.summary, "a.rs, b.rs");
    }
}
