use std::collections::HashSet;
use std::sync::Arc;

use orbit_common::{Role, now_ms, random_hex_suffix};
use orbit_protocol::{DispatchSlot, RouteError};
use serde_json::{Value, json};
use tracing::debug;

use crate::correlation::DispatchAggregate;
use crate::hub::{Outbound, RelayHub};
use crate::routing::SocketId;

/// Dispatch for every `orbit.*` control frame (§4.5.1), returning the
/// frames/closes the caller should flush once the hub lock is released.
pub async fn handle(
    hub: &Arc<RelayHub>,
    id: SocketId,
    role: Role,
    user_id: &str,
    control_type: &str,
    raw: &Value,
) -> Vec<Outbound> {
    match control_type {
        "orbit.subscribe" => subscribe(hub, id, role, user_id, raw).await,
        "orbit.unsubscribe" => unsubscribe(hub, id, role, user_id, raw).await,
        "orbit.list-anchors" => list_anchors(hub, id, user_id).await,
        "orbit.artifacts.list" => artifacts_list(hub, id, user_id, raw).await,
        "orbit.multi-dispatch" => multi_dispatch(hub, id, user_id, raw).await,
        other => {
            debug!(control_type = other, "unrecognised orbit.* control frame");
            Vec::new()
        }
    }
}

fn thread_id_of(raw: &Value) -> Option<String> {
    raw.get("threadId").and_then(Value::as_str).map(str::to_owned)
}

async fn subscribe(hub: &Arc<RelayHub>, id: SocketId, role: Role, user_id: &str, raw: &Value) -> Vec<Outbound> {
    let mut outbound = Vec::new();
    let Some(thread_id) = thread_id_of(raw) else { return outbound };

    let anchor_id = hub
        .with_inner(|inner| {
            inner.routing.subscribe(role, user_id, &thread_id, id);
            inner.routing.sockets.get(&id).and_then(|m| m.anchor_id.clone())
        })
        .await;

    if let (Role::Anchor, Some(anchor_id)) = (role, &anchor_id) {
        if let Err(error) = hub.storage().set_thread_anchor(user_id, &thread_id, Some(anchor_id)).await {
            debug!(%error, "failed to persist thread_anchor on subscribe");
        } else {
            hub.with_inner(|inner| inner.routing.set_thread_anchor_memo(user_id, &thread_id, Some(anchor_id)))
                .await;
        }
    }

    hub.with_inner(|inner| {
        inner.enqueue_frame(&mut outbound, id, json!({ "type": "orbit.subscribed", "threadId": thread_id }))
    })
    .await;

    if role == Role::Client {
        replay_for_client(hub, id, user_id, &thread_id, &mut outbound).await;

        let anchors = hub.with_inner(|inner| inner.routing.thread_anchor_sockets(user_id, &thread_id)).await;
        let notice = json!({ "type": "orbit.client-subscribed", "threadId": thread_id });
        hub.with_inner(|inner| inner.enqueue_broadcast(&mut outbound, &anchors, &notice)).await;
    }

    outbound
}

async fn replay_for_client(
    hub: &Arc<RelayHub>,
    id: SocketId,
    user_id: &str,
    thread_id: &str,
    outbound: &mut Vec<Outbound>,
) {
    let state = match hub.storage().get_thread_state(user_id, thread_id).await {
        Ok(state) => state,
        Err(error) => {
            debug!(%error, "failed to load thread state for replay");
            None
        }
    };
    let messages = match hub.storage().list_thread_messages(user_id, thread_id, hub.retention()).await {
        Ok(messages) => messages,
        Err(error) => {
            debug!(%error, "failed to load replay log");
            Vec::new()
        }
    };

    let turn = match &state {
        Some(s) if s.turn_id.is_some() || s.turn_status.is_some() => {
            json!({ "id": s.turn_id, "status": s.turn_status })
        }
        _ => Value::Null,
    };

    let relay_state = json!({
        "type": "orbit.relay-state",
        "threadId": thread_id,
        "boundAnchorId": state.and_then(|s| s.bound_anchor_id),
        "turn": turn,
        "replayed": messages.len(),
    });

    hub.with_inner(|inner| {
        inner.enqueue_frame(outbound, id, relay_state);
        for message in &messages {
            inner.enqueue_frame(outbound, id, message.raw.clone());
        }
    })
    .await;
}

async fn unsubscribe(hub: &Arc<RelayHub>, id: SocketId, role: Role, user_id: &str, raw: &Value) -> Vec<Outbound> {
    if let Some(thread_id) = thread_id_of(raw) {
        hub.with_inner(|inner| inner.routing.unsubscribe(role, user_id, &thread_id, id)).await;
    }
    Vec::new()
}

async fn list_anchors(hub: &Arc<RelayHub>, id: SocketId, user_id: &str) -> Vec<Outbound> {
    let mut outbound = Vec::new();
    let frame = hub
        .with_inner(|inner| {
            let anchors: Vec<Value> = inner
                .routing
                .user_anchor_sockets(user_id)
                .into_iter()
                .filter_map(|sock| inner.routing.sockets.get(&sock))
                .filter_map(|meta| {
                    meta.anchor_id.as_ref().map(|anchor_id| {
                        json!({
                            "anchorId": anchor_id,
                            "hostname": meta.hostname,
                            "platform": meta.platform,
                            "connectedAt": meta.connected_at,
                        })
                    })
                })
                .collect();
            json!({ "type": "orbit.anchors", "anchors": anchors })
        })
        .await;
    hub.with_inner(|inner| inner.enqueue_frame(&mut outbound, id, frame)).await;
    outbound
}

async fn artifacts_list(hub: &Arc<RelayHub>, id: SocketId, user_id: &str, raw: &Value) -> Vec<Outbound> {
    let mut outbound = Vec::new();
    let thread_id = thread_id_of(raw);
    let limit = raw.get("limit").and_then(Value::as_u64).unwrap_or(50) as usize;
    let before_id = raw.get("beforeId").and_then(Value::as_i64);
    let request_id = raw.get("requestId").cloned();

    let artifacts = match hub.storage().list_artifacts(user_id, thread_id.as_deref(), limit, before_id).await {
        Ok(rows) => rows,
        Err(error) => {
            debug!(%error, "failed to list artifacts");
            Vec::new()
        }
    };

    let next_before_id = artifacts.iter().map(|a| a.id).min();
    let frame = json!({
        "type": "orbit.artifacts",
        "threadId": thread_id,
        "artifacts": artifacts,
        "nextBeforeId": next_before_id,
        "requestId": request_id,
    });
    hub.with_inner(|inner| inner.enqueue_frame(&mut outbound, id, frame)).await;
    outbound
}

async fn multi_dispatch(hub: &Arc<RelayHub>, id: SocketId, user_id: &str, raw: &Value) -> Vec<Outbound> {
    let mut outbound = Vec::new();
    let outer_request_id = match raw.get("requestId").and_then(Value::as_str) {
        Some(s) => s.to_owned(),
        None => {
            debug!("orbit.multi-dispatch without requestId, dropping");
            return outbound;
        }
    };

    let template = raw
        .get("request")
        .or_else(|| raw.get("payload"))
        .cloned()
        .unwrap_or_else(|| {
            json!({
                "method": raw.get("method").cloned().unwrap_or(Value::Null),
                "params": raw.get("params").cloned().unwrap_or(Value::Null),
            })
        });

    let explicit: Option<Vec<String>> = raw
        .get("anchorIds")
        .or_else(|| raw.get("anchors"))
        .and_then(Value::as_array)
        .map(|arr| {
            let mut seen = HashSet::new();
            arr.iter()
                .filter_map(Value::as_str)
                .filter(|a| seen.insert(a.to_owned()))
                .map(str::to_owned)
                .collect()
        });

    let order = hub
        .with_inner(|inner| match &explicit {
            Some(list) => list.clone(),
            None => inner
                .routing
                .user_anchor_sockets(user_id)
                .into_iter()
                .filter_map(|sock| inner.routing.sockets.get(&sock).and_then(|m| m.anchor_id.clone()))
                .collect(),
        })
        .await;

    let mut slots = std::collections::HashMap::new();
    let mut pending = HashSet::new();
    let mut targets = std::collections::HashMap::new();

    hub.with_inner(|inner| {
        for anchor_id in &order {
            let Some(&anchor_socket) = inner.routing.anchor_by_id.get(&(user_id.to_owned(), anchor_id.clone()))
            else {
                slots.insert(anchor_id.clone(), DispatchSlot::err(anchor_id.clone(), RouteError::AnchorNotFound));
                continue;
            };
            let inner_id = format!("{outer_request_id}:{anchor_id}:{}", random_hex_suffix());
            let mut frame = template.clone();
            if let Value::Object(map) = &mut frame {
                map.insert("id".to_owned(), json!(inner_id));
            }
            inner.dispatch.secondary.insert(
                (anchor_socket, inner_id.clone()),
                (id, outer_request_id.clone(), anchor_id.clone()),
            );
            targets.insert(anchor_id.clone(), (anchor_socket, inner_id));
            pending.insert(anchor_id.clone());
            inner.enqueue_frame(&mut outbound, anchor_socket, frame);
        }
    })
    .await;

    if pending.is_empty() {
        let results: Vec<Value> = order
            .iter()
            .filter_map(|anchor_id| slots.get(anchor_id))
            .map(|slot| serde_json::to_value(slot).unwrap_or(Value::Null))
            .collect();
        let frame = json!({
            "type": "orbit.multi-dispatch.result",
            "requestId": outer_request_id,
            "results": results,
            "completedAt": now_ms(),
        });
        hub.with_inner(|inner| inner.enqueue_frame(&mut outbound, id, frame)).await;
        return outbound;
    }

    let key = (id, outer_request_id.clone());
    let timer = hub.spawn_dispatch_timer(key.clone());
    let aggregate = DispatchAggregate { order, slots, pending, targets, timer };
    hub.with_inner(|inner| {
        inner.dispatch.aggregates.insert(key, aggregate);
    })
    .await;

    outbound
}

/// Build the `orbit.multi-dispatch.result` frame for a (possibly just
/// finalised) aggregate.
pub fn dispatch_result_frame(outer_request_id: &str, aggregate: &DispatchAggregate) -> Value {
    json!({
        "type": "orbit.multi-dispatch.result",
        "requestId": outer_request_id,
        "results": aggregate.results_in_order(),
        "completedAt": now_ms(),
    })
}
