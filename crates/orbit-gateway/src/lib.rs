//! Gateway: the relay hub, its axum HTTP/WebSocket front door, and the
//! auth collaborator that authenticates clients and anchors before they
//! ever reach the hub.
//!
//! Lifecycle:
//! 1. Load configuration (retention, dispatch timeout, bind/port, auth TTLs)
//! 2. Open SQLite storage, build the [`hub::RelayHub`]
//! 3. Start the axum server: `/health`, `/auth/*`, `/ws/client`, `/ws/anchor`
//! 4. Each accepted socket is handed to [`ws::run`], which registers it with
//!    the hub and pumps frames until disconnect.

pub mod artifacts;
pub mod auth;
pub mod control;
pub mod correlation;
pub mod hub;
pub mod resolve;
pub mod routing;
pub mod server;
pub mod socket;
pub mod ws;

pub use auth::AppState;
pub use hub::RelayHub;
pub use server::{build_gateway_app, start_gateway};
