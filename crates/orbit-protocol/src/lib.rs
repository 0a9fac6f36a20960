//! Frame classification and the routing error taxonomy for the relay.
//!
//! This crate has no I/O: it is pure parsing and value types shared by
//! `orbit-gateway` and `orbit-storage`.

mod constants;
mod error;
mod frame;
mod parse;

pub use constants::{DEFAULT_MULTI_DISPATCH_TIMEOUT_MS, DEFAULT_RETENTION, ROUTING_ERROR_CODE};
pub use error::{DispatchSlot, RouteError};
pub use frame::ParsedFrame;
pub use parse::{extract_anchor_id, extract_thread_id, parse_frame};
