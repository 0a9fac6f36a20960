use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use orbit_common::{Role, now_ms};
use orbit_protocol::{ParsedFrame, RouteError, parse_frame};
use orbit_storage::Storage;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::debug;

use crate::control;
use crate::correlation::{DispatchTable, PendingMaps};
use crate::routing::{RoutingTables, SocketId, SocketMeta};
use crate::socket::{self, SocketSender};

/// A frame (or close instruction) produced while the hub lock was held,
/// queued so it can be delivered after the lock is released (spec §5:
/// "Notifications produced while holding the lock ... are queued in a
/// local list and flushed after release"). The sender is captured at
/// enqueue time rather than looked up later, since a just-evicted socket
/// is already gone from the routing tables by the time `flush` runs.
pub enum Outbound {
    Frame(SocketSender, Value),
    Close(SocketSender, u16, String),
}

/// Everything reachable only while the hub lock is held.
#[derive(Default)]
pub struct HubInner {
    pub routing: RoutingTables,
    pub pending: PendingMaps,
    pub dispatch: DispatchTable,
}

impl HubInner {
    pub(crate) fn enqueue_frame(&self, outbound: &mut Vec<Outbound>, id: SocketId, frame: Value) {
        if let Some(sender) = self.routing.sender_of(id) {
            outbound.push(Outbound::Frame(sender.clone(), frame));
        }
    }

    pub(crate) fn enqueue_broadcast(&self, outbound: &mut Vec<Outbound>, targets: &[SocketId], frame: &Value) {
        for &target in targets {
            self.enqueue_frame(outbound, target, frame.clone());
        }
    }
}

/// The Relay Hub: the in-memory routing fabric plus the storage calls that
/// keep it durable. One [`Mutex`] guards every routing index, pending map,
/// and dispatch aggregate; nothing outside this module reaches into them
/// directly.
pub struct RelayHub {
    inner: Mutex<HubInner>,
    storage: Arc<dyn Storage>,
    retention: usize,
    dispatch_timeout: Duration,
    next_socket_id: AtomicU64,
}

impl RelayHub {
    pub fn new(storage: Arc<dyn Storage>, retention: usize, dispatch_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HubInner::default()),
            storage,
            retention,
            dispatch_timeout,
            next_socket_id: AtomicU64::new(1),
        })
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Register a freshly accepted socket. For clients, `client_id` (from
    /// the `clientId` query parameter) is bound immediately; anchors gain
    /// their id only once `anchor.hello` arrives. Evicts any colliding
    /// `(user_id, client_id)` registration and sends the newcomer its
    /// `orbit.hello`.
    pub async fn register(
        &self,
        sender: SocketSender,
        role: Role,
        user_id: String,
        client_id: Option<String>,
    ) -> SocketId {
        let id = SocketId::new(self.next_socket_id.fetch_add(1, Ordering::Relaxed));
        let mut outbound = Vec::new();

        {
            let mut inner = self.inner.lock().await;
            inner.routing.insert_socket(
                id,
                SocketMeta {
                    role,
                    user_id: user_id.clone(),
                    client_id: None,
                    anchor_id: None,
                    hostname: None,
                    platform: None,
                    connected_at: now_ms(),
                    sender,
                },
            );

            if let (Role::Client, Some(client_id)) = (role, &client_id) {
                if let Some(previous) = inner.routing.bind_client_id(&user_id, client_id, id) {
                    if let Some(meta) = self.teardown_locked(&mut inner, previous, &mut outbound) {
                        outbound.push(Outbound::Close(
                            meta.sender,
                            1000,
                            "Replaced by newer connection".to_owned(),
                        ));
                    }
                }
            }

            inner.enqueue_frame(
                &mut outbound,
                id,
                json!({ "type": "orbit.hello", "role": role.to_string(), "ts": now_ms() }),
            );
        }

        self.flush(outbound);
        id
    }

    /// Full teardown for a disconnecting socket: subscriptions, id
    /// indices, pending maps, multi-dispatch aggregates, and (for anchors)
    /// clearing any thread bindings the socket owned.
    pub async fn unregister(&self, id: SocketId) {
        let mut outbound = Vec::new();
        let removed = {
            let mut inner = self.inner.lock().await;
            self.teardown_locked(&mut inner, id, &mut outbound)
        };

        if let Some(meta) = &removed {
            if meta.role == Role::Anchor {
                if let Some(anchor_id) = &meta.anchor_id {
                    self.clear_anchor_bindings(&meta.user_id, anchor_id).await;
                }
            }
        }

        self.flush(outbound);
    }

    /// The teardown shared by `unregister` and by collision eviction in
    /// `register`/`anchor.hello`: routing/pending/dispatch cleanup, plus
    /// (for anchors) an `orbit.anchor-disconnected` broadcast to the
    /// user's clients.
    fn teardown_locked(
        &self,
        inner: &mut HubInner,
        id: SocketId,
        outbound: &mut Vec<Outbound>,
    ) -> Option<SocketMeta> {
        let meta = inner.routing.remove_socket(id)?;
        inner.pending.purge_socket(id);
        inner.dispatch.purge_requester(id);
        for key in inner.dispatch.mark_anchor_offline(id) {
            if let Some(agg) = inner.dispatch.aggregates.remove(&key) {
                agg.timer.abort();
                let frame = control::dispatch_result_frame(&key.1, &agg);
                inner.enqueue_frame(outbound, key.0, frame);
            }
        }

        if meta.role == Role::Anchor {
            if let Some(anchor_id) = &meta.anchor_id {
                let clients = inner.routing.user_client_sockets(&meta.user_id);
                let frame = json!({ "type": "orbit.anchor-disconnected", "anchorId": anchor_id });
                inner.enqueue_broadcast(outbound, &clients, &frame);
            }
        }

        Some(meta)
    }

    /// Clear the sticky thread→anchor binding for every thread this anchor
    /// was bound to: storage first, then the memo, per the write-through
    /// discipline.
    async fn clear_anchor_bindings(&self, user_id: &str, anchor_id: &str) {
        let threads: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .routing
                .thread_anchor
                .iter()
                .filter(|((u, _), a)| u == user_id && a.as_str() == anchor_id)
                .map(|((_, t), _)| t.clone())
                .collect()
        };
        for thread_id in threads {
            if let Err(error) = self.storage.set_thread_anchor(user_id, &thread_id, None).await {
                debug!(%error, "failed to clear thread_anchor on anchor disconnect");
                continue;
            }
            let mut inner = self.inner.lock().await;
            inner.routing.set_thread_anchor_memo(user_id, &thread_id, None);
        }
    }

    /// Entry point for every inbound text frame.
    pub async fn handle_message(self: &Arc<Self>, id: SocketId, raw: &str) {
        let Some(parsed) = parse_frame(raw) else {
            self.route_opaque(id, raw).await;
            return;
        };

        let Some((role, user_id)) = self.socket_identity(id).await else {
            debug!("dropping frame from an unregistered socket");
            return;
        };

        if parsed.control_type.as_deref() == Some("ping") {
            let mut outbound = Vec::new();
            let inner = self.inner.lock().await;
            inner.enqueue_frame(&mut outbound, id, json!({ "type": "pong" }));
            drop(inner);
            self.flush(outbound);
            return;
        }

        if let Some(control_type) = parsed.control_type.clone() {
            if control_type == "anchor.hello" {
                self.handle_anchor_hello(id, &user_id, &parsed.raw).await;
                return;
            }
            if control_type.starts_with("orbit.push-") {
                return;
            }
            if control_type.starts_with("orbit.") {
                self.handle_control(id, role, &user_id, &control_type, &parsed.raw).await;
                return;
            }
        }

        self.route(id, role, &user_id, &parsed).await;
    }

    /// A frame that failed to parse as JSON (or wasn't an object) still
    /// gets routed — it simply carries no correlation metadata, so it
    /// falls through to the broadcast fallback of the routing machine.
    async fn route_opaque(self: &Arc<Self>, id: SocketId, raw: &str) {
        let Some((role, user_id)) = self.socket_identity(id).await else { return };
        let opaque = ParsedFrame {
            raw: Value::String(raw.to_owned()),
            control_type: None,
            method: None,
            request_key: None,
            thread_id: None,
            anchor_id: None,
        };
        self.route(id, role, &user_id, &opaque).await;
    }

    async fn socket_identity(&self, id: SocketId) -> Option<(Role, String)> {
        let inner = self.inner.lock().await;
        inner.routing.sockets.get(&id).map(|m| (m.role, m.user_id.clone()))
    }

    async fn handle_anchor_hello(&self, id: SocketId, user_id: &str, raw: &Value) {
        let mut outbound = Vec::new();
        let anchor_id = raw
            .get("anchorId")
            .and_then(Value::as_str)
            .or_else(|| raw.get("deviceId").and_then(Value::as_str))
            .map(str::to_owned)
            .unwrap_or_else(orbit_common::random_hex_128);
        let hostname = raw.get("hostname").and_then(Value::as_str).map(str::to_owned);
        let platform = raw.get("platform").and_then(Value::as_str).map(str::to_owned);

        {
            let mut inner = self.inner.lock().await;
            if let Some(previous) =
                inner.routing.bind_anchor_id(user_id, &anchor_id, id, hostname, platform)
            {
                if let Some(meta) = self.teardown_locked(&mut inner, previous, &mut outbound) {
                    outbound.push(Outbound::Close(
                        meta.sender,
                        1000,
                        "Replaced by newer connection".to_owned(),
                    ));
                }
            }
            let clients = inner.routing.user_client_sockets(user_id);
            let frame = json!({ "type": "orbit.anchor-connected", "anchorId": anchor_id });
            inner.enqueue_broadcast(&mut outbound, &clients, &frame);
        }

        self.flush(outbound);
    }

    async fn handle_control(
        self: &Arc<Self>,
        id: SocketId,
        role: Role,
        user_id: &str,
        control_type: &str,
        raw: &Value,
    ) {
        let outbound = control::handle(self, id, role, user_id, control_type, raw).await;
        self.flush(outbound);
    }

    /// The C5 routing state machine (client→anchor and anchor→client).
    async fn route(self: &Arc<Self>, id: SocketId, role: Role, user_id: &str, parsed: &ParsedFrame) {
        let outbound = match role {
            Role::Client => self.route_client_to_anchor(id, user_id, parsed).await,
            Role::Anchor => self.route_anchor_to_client(id, user_id, parsed).await,
        };
        self.flush(outbound);
    }

    async fn route_client_to_anchor(&self, id: SocketId, user_id: &str, parsed: &ParsedFrame) -> Vec<Outbound> {
        let mut outbound = Vec::new();

        if parsed.is_response() {
            let request_key = parsed.request_key.clone().unwrap_or_default();
            let mut inner = self.inner.lock().await;
            if let Some(anchor) = inner.pending.from_anchor.remove(&(id, request_key)) {
                inner.enqueue_frame(&mut outbound, anchor, parsed.raw.clone());
                return outbound;
            }
        }

        let resolution = {
            let inner = self.inner.lock().await;
            crate::resolve::resolve_target_anchor(
                &inner.routing,
                self.storage.as_ref(),
                user_id,
                parsed.thread_id.as_deref(),
                parsed.anchor_id.as_deref(),
            )
            .await
        };

        let resolution = match resolution {
            Ok(r) => r,
            Err(error) => {
                debug!(%error, "storage error resolving client target");
                return outbound;
            }
        };

        let target = match resolution {
            Ok(target) => target,
            Err(route_error) => {
                if let Some(request_id) = parsed.raw.get("id") {
                    let inner = self.inner.lock().await;
                    inner.enqueue_frame(&mut outbound, id, route_error.reply_frame(request_id));
                }
                return outbound;
            }
        };

        if let (Some(anchor_id), Some(thread_id)) = (&target.newly_bound, &parsed.thread_id) {
            if let Err(error) = self.storage.set_thread_anchor(user_id, thread_id, Some(anchor_id)).await {
                debug!(%error, "failed to persist thread_anchor binding");
            } else {
                let mut inner = self.inner.lock().await;
                inner.routing.set_thread_anchor_memo(user_id, thread_id, Some(anchor_id));
            }
        }

        let mut inner = self.inner.lock().await;
        if parsed.has_method() {
            if let Some(request_key) = &parsed.request_key {
                inner.pending.from_client.insert((target.socket, request_key.clone()), id);
            }
        }
        inner.enqueue_frame(&mut outbound, target.socket, parsed.raw.clone());
        outbound
    }

    async fn route_anchor_to_client(&self, id: SocketId, user_id: &str, parsed: &ParsedFrame) -> Vec<Outbound> {
        let mut outbound = Vec::new();

        if parsed.is_response() {
            let request_key = parsed.request_key.clone().unwrap_or_default();

            let multi_hit = {
                let mut inner = self.inner.lock().await;
                inner.dispatch.secondary.remove(&(id, request_key.clone()))
            };
            if let Some((requester, outer_id, anchor_id)) = multi_hit {
                let mut inner = self.inner.lock().await;
                let completed = if let Some(agg) = inner.dispatch.aggregates.get_mut(&(requester, outer_id.clone())) {
                    agg.slots.insert(
                        anchor_id.clone(),
                        orbit_protocol::DispatchSlot::ok(anchor_id.clone(), parsed.raw.clone()),
                    );
                    agg.pending.remove(&anchor_id);
                    agg.targets.remove(&anchor_id);
                    agg.is_complete()
                } else {
                    false
                };
                if completed {
                    if let Some(agg) = inner.dispatch.aggregates.remove(&(requester, outer_id.clone())) {
                        agg.timer.abort();
                        let frame = control::dispatch_result_frame(&outer_id, &agg);
                        inner.enqueue_frame(&mut outbound, requester, frame);
                    }
                }
                return outbound;
            }

            let client_hit = {
                let mut inner = self.inner.lock().await;
                inner.pending.from_client.remove(&(id, request_key))
            };
            if let Some(client) = client_hit {
                if let Some(thread_id) = &parsed.thread_id {
                    self.capture(user_id, thread_id, &parsed.raw).await;
                }
                let inner = self.inner.lock().await;
                inner.enqueue_frame(&mut outbound, client, parsed.raw.clone());
                return outbound;
            }
            // Neither a multi-dispatch nor a pending_from_client entry matched:
            // this isn't a correlated response after all. Treat it as an
            // unsolicited notification and fall through to normal routing.
        }

        if let (Some(thread_id), Some(anchor_id)) = (&parsed.thread_id, &parsed.anchor_id) {
            if let Err(error) = self.storage.set_thread_anchor(user_id, thread_id, Some(anchor_id)).await {
                debug!(%error, "failed to persist thread_anchor binding");
            } else {
                let mut inner = self.inner.lock().await;
                inner.routing.set_thread_anchor_memo(user_id, thread_id, Some(anchor_id));
            }
        }

        let targets = {
            let inner = self.inner.lock().await;
            match &parsed.thread_id {
                Some(thread_id) => {
                    let subs = inner.routing.thread_client_sockets(user_id, thread_id);
                    if subs.is_empty() {
                        inner.routing.user_client_sockets(user_id)
                    } else {
                        subs
                    }
                }
                None => inner.routing.user_client_sockets(user_id),
            }
        };

        if parsed.has_method() {
            if let Some(request_key) = &parsed.request_key {
                let mut inner = self.inner.lock().await;
                for target in &targets {
                    inner.pending.from_anchor.insert((*target, request_key.clone()), id);
                }
            }
        }

        if let Some(thread_id) = &parsed.thread_id {
            self.capture(user_id, thread_id, &parsed.raw).await;
        }

        let inner = self.inner.lock().await;
        inner.enqueue_broadcast(&mut outbound, &targets, &parsed.raw);
        outbound
    }

    /// The C6 artifact/turn-state capture step run on every captured
    /// anchor→client frame.
    async fn capture(&self, user_id: &str, thread_id: &str, raw: &Value) {
        if let Err(error) = self.storage.append_thread_message(user_id, thread_id, raw, self.retention).await {
            debug!(%error, "failed to append thread message");
            return;
        }

        let Some(method) = raw.get("method").and_then(Value::as_str) else { return };
        let Some(params) = raw.get("params") else { return };

        if method == "turn/started" || method == "turn/completed" {
            let update = crate::artifacts::extract_turn_update(params);
            if !update.is_empty() {
                if let Err(error) = self
                    .storage
                    .set_thread_turn(user_id, thread_id, update.turn_id.as_deref(), update.turn_status.as_deref())
                    .await
                {
                    debug!(%error, "failed to persist turn state");
                }
            }
        } else if method == "item/completed" {
            let current_turn = self
                .storage
                .get_thread_state(user_id, thread_id)
                .await
                .ok()
                .flatten()
                .and_then(|s| s.turn_id);
            if let Some(artifact) =
                crate::artifacts::extract_artifact(user_id, thread_id, params, current_turn.as_deref())
            {
                if let Err(error) = self.storage.upsert_artifact(artifact, self.retention).await {
                    debug!(%error, "failed to upsert artifact");
                }
            }
        }
    }

    /// Spawn the 15-second multi-dispatch timer. Cancelled synchronously
    /// from whichever path finalises the aggregate first — natural
    /// completion, timeout, or requester/anchor disconnect.
    pub(crate) fn spawn_dispatch_timer(
        self: &Arc<Self>,
        key: (SocketId, String),
    ) -> tokio::task::JoinHandle<()> {
        let hub = Arc::clone(self);
        let timeout = self.dispatch_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            hub.finalize_dispatch_timeout(key).await;
        })
    }

    async fn finalize_dispatch_timeout(&self, key: (SocketId, String)) {
        let mut outbound = Vec::new();
        let mut inner = self.inner.lock().await;
        if let Some(mut agg) = inner.dispatch.aggregates.remove(&key) {
            for anchor_id in agg.pending.drain().collect::<Vec<_>>() {
                if let Some((asock, inner_id)) = agg.targets.remove(&anchor_id) {
                    inner.dispatch.secondary.remove(&(asock, inner_id));
                }
                agg.slots.insert(
                    anchor_id.clone(),
                    orbit_protocol::DispatchSlot::err(anchor_id, RouteError::Timeout),
                );
            }
            let frame = control::dispatch_result_frame(&key.1, &agg);
            inner.enqueue_frame(&mut outbound, key.0, frame);
        }
        drop(inner);
        self.flush(outbound);
    }

    pub(crate) async fn with_inner<R>(&self, f: impl FnOnce(&mut HubInner) -> R) -> R {
        let mut inner = self.inner.lock().await;
        f(&mut inner)
    }

    pub(crate) fn storage_ref(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    pub(crate) fn retention(&self) -> usize {
        self.retention
    }

    fn flush(&self, outbound: Vec<Outbound>) {
        for item in outbound {
            match item {
                Outbound::Frame(sender, frame) => socket::send(&sender, &frame),
                Outbound::Close(sender, code, reason) => socket::close(&sender, code, reason),
            }
        }
    }
}
