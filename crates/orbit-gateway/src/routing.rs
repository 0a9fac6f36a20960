use std::collections::{HashMap, HashSet};

use orbit_common::Role;

use crate::socket::SocketSender;

/// A socket's identity inside the hub. Sockets themselves are owned by their
/// I/O tasks, not the hub; the hub only ever holds a monotonically assigned
/// id plus a channel to talk to the socket's write loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Per-socket metadata kept for the lifetime of a registration.
pub struct SocketMeta {
    pub role: Role,
    pub user_id: String,
    pub client_id: Option<String>,
    pub anchor_id: Option<String>,
    pub hostname: Option<String>,
    pub platform: Option<String>,
    pub connected_at: u64,
    pub sender: SocketSender,
}

/// The in-memory routing indices a live hub maintains, all reachable only
/// while the hub lock is held.
#[derive(Default)]
pub struct RoutingTables {
    pub sockets: HashMap<SocketId, SocketMeta>,
    pub user_clients: HashMap<String, HashSet<SocketId>>,
    pub user_anchors: HashMap<String, HashSet<SocketId>>,
    pub client_by_id: HashMap<(String, String), SocketId>,
    pub anchor_by_id: HashMap<(String, String), SocketId>,
    pub thread_clients: HashMap<(String, String), HashSet<SocketId>>,
    pub thread_anchors: HashMap<(String, String), HashSet<SocketId>>,
    pub thread_anchor: HashMap<(String, String), String>,
}

impl RoutingTables {
    pub fn insert_socket(&mut self, id: SocketId, meta: SocketMeta) {
        match meta.role {
            Role::Client => {
                self.user_clients.entry(meta.user_id.clone()).or_default().insert(id);
            }
            Role::Anchor => {
                self.user_anchors.entry(meta.user_id.clone()).or_default().insert(id);
            }
        }
        self.sockets.insert(id, meta);
    }

    /// Bind `client_id` to `id`, returning the socket it displaced, if any.
    pub fn bind_client_id(&mut self, user_id: &str, client_id: &str, id: SocketId) -> Option<SocketId> {
        let key = (user_id.to_owned(), client_id.to_owned());
        let previous = self.client_by_id.insert(key, id);
        if let Some(meta) = self.sockets.get_mut(&id) {
            meta.client_id = Some(client_id.to_owned());
        }
        previous
    }

    /// Bind `anchor_id` to `id`, returning the socket it displaced, if any.
    pub fn bind_anchor_id(
        &mut self,
        user_id: &str,
        anchor_id: &str,
        id: SocketId,
        hostname: Option<String>,
        platform: Option<String>,
    ) -> Option<SocketId> {
        let key = (user_id.to_owned(), anchor_id.to_owned());
        let previous = self.anchor_by_id.insert(key, id);
        if let Some(meta) = self.sockets.get_mut(&id) {
            meta.anchor_id = Some(anchor_id.to_owned());
            meta.hostname = hostname;
            meta.platform = platform;
        }
        previous
    }

    pub fn subscribe(&mut self, role: Role, user_id: &str, thread_id: &str, id: SocketId) {
        let key = (user_id.to_owned(), thread_id.to_owned());
        let table = match role {
            Role::Client => &mut self.thread_clients,
            Role::Anchor => &mut self.thread_anchors,
        };
        table.entry(key).or_default().insert(id);
    }

    pub fn unsubscribe(&mut self, role: Role, user_id: &str, thread_id: &str, id: SocketId) {
        let key = (user_id.to_owned(), thread_id.to_owned());
        let table = match role {
            Role::Client => &mut self.thread_clients,
            Role::Anchor => &mut self.thread_anchors,
        };
        if let Some(set) = table.get_mut(&key) {
            set.remove(&id);
            if set.is_empty() {
                table.remove(&key);
            }
        }
    }

    /// Memoise the sticky thread→anchor binding. Callers must write through
    /// to storage first so a crash leaves at worst a stale memo.
    pub fn set_thread_anchor_memo(&mut self, user_id: &str, thread_id: &str, anchor_id: Option<&str>) {
        let key = (user_id.to_owned(), thread_id.to_owned());
        match anchor_id {
            Some(a) => {
                self.thread_anchor.insert(key, a.to_owned());
            }
            None => {
                self.thread_anchor.remove(&key);
            }
        }
    }

    pub fn thread_anchor_memo(&self, user_id: &str, thread_id: &str) -> Option<&str> {
        self.thread_anchor
            .get(&(user_id.to_owned(), thread_id.to_owned()))
            .map(String::as_str)
    }

    /// Full teardown of every index referencing `id`. Returns the socket's
    /// metadata (role, user_id, bound ids) for the caller to act on.
    pub fn remove_socket(&mut self, id: SocketId) -> Option<SocketMeta> {
        let meta = self.sockets.remove(&id)?;

        match meta.role {
            Role::Client => {
                if let Some(set) = self.user_clients.get_mut(&meta.user_id) {
                    set.remove(&id);
                }
            }
            Role::Anchor => {
                if let Some(set) = self.user_anchors.get_mut(&meta.user_id) {
                    set.remove(&id);
                }
            }
        }

        // A displaced socket is torn down *after* its replacement has already
        // bound the same (user_id, id) key (see `register`/`bind_anchor_id`),
        // so these removals must only fire if the key still points at this
        // socket — otherwise tearing down the old registration would delete
        // the new one.
        if let Some(client_id) = &meta.client_id {
            let key = (meta.user_id.clone(), client_id.clone());
            if self.client_by_id.get(&key) == Some(&id) {
                self.client_by_id.remove(&key);
            }
        }
        if let Some(anchor_id) = &meta.anchor_id {
            let key = (meta.user_id.clone(), anchor_id.clone());
            if self.anchor_by_id.get(&key) == Some(&id) {
                self.anchor_by_id.remove(&key);
            }
        }

        self.thread_clients.retain(|k, set| {
            if k.0 == meta.user_id {
                set.remove(&id);
            }
            !set.is_empty()
        });
        self.thread_anchors.retain(|k, set| {
            if k.0 == meta.user_id {
                set.remove(&id);
            }
            !set.is_empty()
        });

        Some(meta)
    }

    pub fn sender_of(&self, id: SocketId) -> Option<&SocketSender> {
        self.sockets.get(&id).map(|m| &m.sender)
    }

    pub fn user_anchor_sockets(&self, user_id: &str) -> Vec<SocketId> {
        self.user_anchors.get(user_id).map(|s| s.iter().copied().collect()).unwrap_or_default()
    }

    pub fn user_client_sockets(&self, user_id: &str) -> Vec<SocketId> {
        self.user_clients.get(user_id).map(|s| s.iter().copied().collect()).unwrap_or_default()
    }

    pub fn thread_client_sockets(&self, user_id: &str, thread_id: &str) -> Vec<SocketId> {
        self.thread_clients
            .get(&(user_id.to_owned(), thread_id.to_owned()))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn thread_anchor_sockets(&self, user_id: &str, thread_id: &str) -> Vec<SocketId> {
        self.thread_anchors
            .get(&(user_id.to_owned(), thread_id.to_owned()))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }
}
