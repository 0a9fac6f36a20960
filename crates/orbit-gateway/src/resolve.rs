use orbit_protocol::RouteError;
use orbit_storage::Storage;

use crate::routing::{RoutingTables, SocketId};

/// The outcome of resolving a client→anchor target.
pub struct ResolvedTarget {
    pub socket: SocketId,
    /// `Some(anchor_id)` when this resolution just established the
    /// thread→anchor binding for the first time and the caller must write
    /// it through to storage before memoising it.
    pub newly_bound: Option<String>,
}

async fn existing_binding(
    routing: &RoutingTables,
    storage: &dyn Storage,
    user_id: &str,
    thread_id: &str,
) -> anyhow::Result<Option<String>> {
    if let Some(memo) = routing.thread_anchor_memo(user_id, thread_id) {
        return Ok(Some(memo.to_owned()));
    }
    Ok(storage
        .get_thread_state(user_id, thread_id)
        .await?
        .and_then(|s| s.bound_anchor_id))
}

/// Resolve the anchor socket a client→anchor frame should be routed to
/// (the C5 target resolution state machine).
pub async fn resolve_target_anchor(
    routing: &RoutingTables,
    storage: &dyn Storage,
    user_id: &str,
    thread_id: Option<&str>,
    anchor_id: Option<&str>,
) -> anyhow::Result<Result<ResolvedTarget, RouteError>> {
    if let Some(anchor_id) = anchor_id {
        let Some(&socket) = routing.anchor_by_id.get(&(user_id.to_owned(), anchor_id.to_owned()))
        else {
            return Ok(Err(RouteError::AnchorNotFound));
        };

        if let Some(thread_id) = thread_id {
            match existing_binding(routing, storage, user_id, thread_id).await? {
                Some(bound) if bound != anchor_id => {
                    return Ok(Err(RouteError::ThreadAnchorMismatch));
                }
                Some(_) => return Ok(Ok(ResolvedTarget { socket, newly_bound: None })),
                None => {
                    return Ok(Ok(ResolvedTarget {
                        socket,
                        newly_bound: Some(anchor_id.to_owned()),
                    }));
                }
            }
        }
        return Ok(Ok(ResolvedTarget { socket, newly_bound: None }));
    }

    if let Some(thread_id) = thread_id {
        if let Some(bound) = existing_binding(routing, storage, user_id, thread_id).await? {
            return Ok(match routing.anchor_by_id.get(&(user_id.to_owned(), bound)) {
                Some(&socket) => Ok(ResolvedTarget { socket, newly_bound: None }),
                None => Err(RouteError::AnchorOffline),
            });
        }

        let subscribers = routing.thread_anchor_sockets(user_id, thread_id);
        match subscribers.len() {
            1 => {
                let socket = subscribers[0];
                let anchor_id = routing.sockets.get(&socket).and_then(|m| m.anchor_id.clone());
                return Ok(Ok(ResolvedTarget { socket, newly_bound: anchor_id }));
            }
            n if n > 1 => return Ok(Err(RouteError::ThreadAnchorMismatch)),
            _ => {}
        }
    }

    let anchors = routing.user_anchor_sockets(user_id);
    match anchors.len() {
        0 => Ok(Err(RouteError::AnchorOffline)),
        1 => Ok(Ok(ResolvedTarget { socket: anchors[0], newly_bound: None })),
        _ => Ok(Err(RouteError::AnchorRequired)),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::SocketMeta;
    use orbit_common::Role;
    use orbit_storage::SqliteStorage;
    use sqlx::SqlitePool;
    use tokio::sync::mpsc;

    async fn storage() -> SqliteStorage {
        let pool = SqlitePool::connect("sqlite::memory:").await.expect("pool");
        SqliteStorage::init(&pool).await.expect("init");
        SqliteStorage::new(pool)
    }

    fn register_anchor(routing: &mut RoutingTables, user: &str, anchor_id: &str) -> SocketId {
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = SocketId::new(routing.sockets.len() as u64 + 1);
        routing.insert_socket(
            id,
            SocketMeta {
                role: Role::Anchor,
                user_id: user.to_owned(),
                client_id: None,
                anchor_id: None,
                hostname: None,
                platform: None,
                connected_at: 0,
                sender: tx,
            },
        );
        routing.bind_anchor_id(user, anchor_id, id, None, None);
        id
    }

    #[tokio::test]
    async fn single_anchor_is_used_when_nothing_else_specified() {
        let mut routing = RoutingTables::default();
        let id = register_anchor(&mut routing, "u1", "only");
        let store = storage().await;

        let resolved = resolve_target_anchor(&routing, &store, "u1", None, None)
            .await
            .expect("ok")
            .expect("resolved");
        assert_eq!(resolved.socket, id);
    }

    #[tokio::test]
    async fn zero_anchors_is_offline() {
        let routing = RoutingTables::default();
        let store = storage().await;
        let err = resolve_target_anchor(&routing, &store, "u1", None, None)
            .await
            .expect("ok")
            .expect_err("offline");
        assert_eq!(err, RouteError::AnchorOffline);
    }

    #[tokio::test]
    async fn multiple_anchors_without_selector_requires_anchor_id() {
        let mut routing = RoutingTables::default();
        register_anchor(&mut routing, "u1", "a");
        register_anchor(&mut routing, "u1", "b");
        let store = storage().await;

        let err = resolve_target_anchor(&routing, &store, "u1", None, None)
            .await
            .expect("ok")
            .expect_err("required");
        assert_eq!(err, RouteError::AnchorRequired);
    }

    #[tokio::test]
    async fn explicit_anchor_mismatched_with_bound_thread_fails() {
        let mut routing = RoutingTables::default();
        register_anchor(&mut routing, "u1", "a");
        register_anchor(&mut routing, "u1", "b");
        let store = storage().await;
        store.set_thread_anchor("u1", "t1", Some("a")).await.expect("bind");
        routing.set_thread_anchor_memo("u1", "t1", Some("a"));

        let err = resolve_target_anchor(&routing, &store, "u1", Some("t1"), Some("b"))
            .await
            .expect("ok")
            .expect_err("mismatch");
        assert_eq!(err, RouteError::ThreadAnchorMismatch);
    }

    #[tokio::test]
    async fn unbound_thread_with_single_subscriber_resolves_and_binds() {
        let mut routing = RoutingTables::default();
        let id = register_anchor(&mut routing, "u1", "a");
        routing.subscribe(Role::Anchor, "u1", "t1", id);
        let store = storage().await;

        let resolved = resolve_target_anchor(&routing, &store, "u1", Some("t1"), None)
            .await
            .expect("ok")
            .expect("resolved");
        assert_eq!(resolved.socket, id);
        assert_eq!(resolved.newly_bound.as_deref(), Some("a"));
    }
}
