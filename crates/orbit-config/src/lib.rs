//! Configuration loading for `orbitd`: config-file discovery plus
//! `ORBIT_*` / auth-collaborator environment variable overrides.

mod env_subst;
mod loader;
mod schema;

pub use loader::{data_dir, discover_and_load, load_config};
pub use schema::{AuthConfig, OrbitConfig};
