//! Small dependency-light helpers shared across the `orbit` workspace.

mod ids;
mod role;
mod time;

pub use ids::{random_hex_128, random_hex_suffix};
pub use role::Role;
pub use time::{now_ms, now_sec};
