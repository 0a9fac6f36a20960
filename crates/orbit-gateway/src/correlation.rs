use std::collections::{HashMap, HashSet};

use orbit_protocol::DispatchSlot;
use tokio::task::JoinHandle;

use crate::routing::SocketId;

/// The two pending-request maps: responses are routed purely by id match,
/// never by holding a future per in-flight request.
#[derive(Default)]
pub struct PendingMaps {
    /// `(target_anchor_socket, request_key) → client_socket`
    pub from_client: HashMap<(SocketId, String), SocketId>,
    /// `(target_client_socket, request_key) → anchor_socket`
    pub from_anchor: HashMap<(SocketId, String), SocketId>,
}

impl PendingMaps {
    /// Drop every pending entry that names `id` as either key-socket or
    /// value-socket, so a disconnect never leaves a dangling correlation.
    pub fn purge_socket(&mut self, id: SocketId) {
        self.from_client.retain(|(target, _), origin| *target != id && *origin != id);
        self.from_anchor.retain(|(target, _), origin| *target != id && *origin != id);
    }
}

/// One client-initiated fan-out in progress: an ordered list of anchor ids,
/// a result slot per anchor, the still-outstanding subset, and enough
/// bookkeeping to unwind a single target on that anchor's disconnect.
pub struct DispatchAggregate {
    pub order: Vec<String>,
    pub slots: HashMap<String, DispatchSlot>,
    pub pending: HashSet<String>,
    /// `anchor_id → (anchor_socket, inner_request_key)`, populated only for
    /// anchors the fan-out actually reached (unreachable ones are filled
    /// into `slots` immediately and never appear here).
    pub targets: HashMap<String, (SocketId, String)>,
    pub timer: JoinHandle<()>,
}

impl DispatchAggregate {
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    /// Build the `orbit.multi-dispatch.result` payload's `results` array,
    /// in the original request order.
    pub fn results_in_order(&self) -> Vec<serde_json::Value> {
        self.order
            .iter()
            .filter_map(|anchor_id| self.slots.get(anchor_id))
            .map(|slot| serde_json::to_value(slot).unwrap_or(serde_json::Value::Null))
            .collect()
    }
}

/// `(requester_socket, outer_request_id)` — the primary key for a live
/// multi-dispatch aggregate.
pub type DispatchKey = (SocketId, String);

/// `(anchor_socket, inner_request_key) → (requester_socket, outer_request_id, anchor_id)`
pub type DispatchSecondary = HashMap<(SocketId, String), (SocketId, String, String)>;

#[derive(Default)]
pub struct DispatchTable {
    pub aggregates: HashMap<DispatchKey, DispatchAggregate>,
    pub secondary: DispatchSecondary,
}

impl DispatchTable {
    /// Remove every aggregate and secondary entry touching `id`, aborting
    /// their timers. Used for requester disconnect (the whole aggregate is
    /// meaningless once nobody can receive the result).
    pub fn purge_requester(&mut self, id: SocketId) {
        let dead: Vec<DispatchKey> = self
            .aggregates
            .keys()
            .filter(|(requester, _)| *requester == id)
            .cloned()
            .collect();
        for key in dead {
            if let Some(agg) = self.aggregates.remove(&key) {
                agg.timer.abort();
                for (asock, inner_id) in agg.targets.values() {
                    self.secondary.remove(&(*asock, inner_id.clone()));
                }
            }
        }
    }

    /// Mark every still-pending slot targeting the departing anchor socket
    /// as offline, without tearing down the whole aggregate (other anchors
    /// may still be outstanding). Returns the keys that became complete as
    /// a result, so the caller can finalise them.
    pub fn mark_anchor_offline(&mut self, id: SocketId) -> Vec<DispatchKey> {
        let mut completed = Vec::new();
        let touched: Vec<(DispatchKey, String, String)> = self
            .secondary
            .iter()
            .filter(|(k, _)| k.0 == id)
            .map(|(k, v)| ((v.0, v.1.clone()), v.2.clone(), k.1.clone()))
            .collect();

        for (agg_key, anchor_id, inner_id) in touched {
            self.secondary.remove(&(id, inner_id));
            if let Some(agg) = self.aggregates.get_mut(&agg_key) {
                agg.slots.insert(
                    anchor_id.clone(),
                    DispatchSlot::err(anchor_id.clone(), orbit_protocol::RouteError::AnchorOffline),
                );
                agg.pending.remove(&anchor_id);
                agg.targets.remove(&anchor_id);
                if agg.is_complete() {
                    completed.push(agg_key);
                }
            }
        }
        completed
    }
}
