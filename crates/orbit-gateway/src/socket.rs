use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

/// A unit handed down a socket's write-loop channel. Splitting `Close` out
/// from `Text` lets the hub ask the I/O task to emit a WebSocket close
/// frame with a specific code/reason (spec.md §3 "replaced by newer
/// connection").
#[derive(Debug, Clone)]
pub enum SocketCommand {
    Text(String),
    Close { code: u16, reason: String },
}

pub type SocketSender = mpsc::UnboundedSender<SocketCommand>;

/// Uniform text-frame send with best-effort error swallowing (spec.md §C7,
/// §5 "all socket sends are wrapped so that errors are swallowed and never
/// surface to other peers"). Logs at `debug`, never `warn`, since a failed
/// send against an ordinary disconnect is expected, not exceptional.
pub fn send(tx: &SocketSender, frame: &Value) {
    let Ok(text) = serde_json::to_string(frame) else {
        debug!("dropping frame that failed to serialize");
        return;
    };
    if tx.send(SocketCommand::Text(text)).is_err() {
        debug!("dropping send to a closed socket");
    }
}

/// Ask the write loop to close with the given code/reason. Best-effort;
/// a socket that is already gone is not an error.
pub fn close(tx: &SocketSender, code: u16, reason: impl Into<String>) {
    let _ = tx.send(SocketCommand::Close {
        code,
        reason: reason.into(),
    });
}
