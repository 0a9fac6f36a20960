use secrecy::SecretString;
use serde::Deserialize;

fn default_retention() -> usize {
    orbit_protocol_defaults::DEFAULT_RETENTION
}

fn default_dispatch_timeout_ms() -> u64 {
    orbit_protocol_defaults::DEFAULT_MULTI_DISPATCH_TIMEOUT_MS
}

/// Mirrors `orbit_protocol::{DEFAULT_RETENTION, DEFAULT_MULTI_DISPATCH_TIMEOUT_MS}`
/// without adding an I/O-free crate as a dependency of a config-only crate.
mod orbit_protocol_defaults {
    pub const DEFAULT_RETENTION: usize = 200;
    pub const DEFAULT_MULTI_DISPATCH_TIMEOUT_MS: u64 = 15_000;
}

fn default_bind() -> String {
    "0.0.0.0".to_owned()
}

fn default_port() -> u16 {
    8787
}

fn default_database_path() -> String {
    "./data/orbit.db".to_owned()
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_owned()]
}

/// Root configuration for `orbitd` (spec.md §6 "Environment knobs").
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrbitConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Per-`(user_id, thread_id)` retention N for the message log and
    /// artifact index (spec.md §3).
    #[serde(default = "default_retention")]
    pub retention: usize,
    /// Multi-dispatch aggregation timeout, in milliseconds (spec.md §4.4).
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
    pub auth: AuthConfig,
}

impl Default for OrbitConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            retention: default_retention(),
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
            database_path: default_database_path(),
            cors_origins: default_cors_origins(),
            auth: AuthConfig::default(),
        }
    }
}

/// Configuration for the out-of-scope auth collaborator (spec.md §1), kept
/// here because the gateway's HTTP surface must still run one.
///
/// Deliberately `Deserialize`-only: `secrecy::SecretString` has no
/// `Serialize` impl, so this config can be loaded from a file or
/// environment but never accidentally re-serialized with its secrets
/// intact. Callers that need to display it (`orbitd config show`) build a
/// redacted `serde_json::Value` by hand instead.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub mode: String,
    pub web_jwt_secret: SecretString,
    pub anchor_jwt_secret: SecretString,
    pub access_ttl_sec: u64,
    pub refresh_ttl_sec: u64,
    pub anchor_access_ttl_sec: u64,
    pub anchor_refresh_ttl_sec: u64,
    pub device_code_ttl_sec: u64,
    pub device_poll_interval_sec: u64,
    pub device_verification_url: String,
    pub challenge_ttl_sec: u64,
    pub passkey_origin: String,
    pub passkey_rp_id: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: "basic".to_owned(),
            web_jwt_secret: SecretString::from("dev-web-secret-change-me".to_owned()),
            anchor_jwt_secret: SecretString::from("dev-anchor-secret-change-me".to_owned()),
            access_ttl_sec: 3600,
            refresh_ttl_sec: 604_800,
            anchor_access_ttl_sec: 86_400,
            anchor_refresh_ttl_sec: 2_592_000,
            device_code_ttl_sec: 600,
            device_poll_interval_sec: 5,
            device_verification_url: "http://localhost:5173/device".to_owned(),
            challenge_ttl_sec: 300,
            passkey_origin: String::new(),
            passkey_rp_id: String::new(),
        }
    }
}
