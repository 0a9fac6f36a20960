use std::path::{Path, PathBuf};

use secrecy::SecretString;
use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::OrbitConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["orbit.toml", "orbit.yaml", "orbit.yml", "orbit.json"];

/// Load config from the given path (any supported format), with
/// `${VAR}` substitution applied to the raw text first.
pub fn load_config(path: &Path) -> anyhow::Result<OrbitConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<OrbitConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

/// Discover and load config from the current directory, then layer
/// environment variable overrides on top. Returns defaults (still subject
/// to env overrides) if no config file is found.
///
/// Search order: `./orbit.{toml,yaml,yml,json}`.
pub fn discover_and_load() -> OrbitConfig {
    let mut config = find_config_file()
        .and_then(|path| {
            debug!(path = %path.display(), "loading config");
            match load_config(&path) {
                Ok(cfg) => Some(cfg),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                    None
                }
            }
        })
        .unwrap_or_default();
    apply_env_overrides(&mut config);
    config
}

fn find_config_file() -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

/// Returns the data directory used for the default SQLite file, falling
/// back to the current directory when the platform has no home dir.
pub fn data_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().join(".orbit"))
        .unwrap_or_else(|| PathBuf::from(".orbit"))
}

/// Apply `ORBIT_*` environment variable overrides, mirroring the original
/// control-plane's flat env-var surface (spec.md §6, and the auth
/// collaborator grounded on `original_source/.../config.py`).
fn apply_env_overrides(config: &mut OrbitConfig) {
    if let Some(v) = env_str("ORBIT_BIND") {
        config.bind = v;
    }
    if let Some(v) = env_parsed::<u16>("ORBIT_PORT") {
        config.port = v;
    }
    if let Some(v) = env_parsed::<usize>("ORBIT_RETENTION") {
        config.retention = v.max(1);
    }
    if let Some(v) = env_parsed::<u64>("ORBIT_DISPATCH_TIMEOUT_MS") {
        config.dispatch_timeout_ms = v.max(1);
    }
    if let Some(v) = env_str("ORBIT_DATABASE_PATH") {
        config.database_path = v;
    }
    if let Some(v) = env_str("ORBIT_CORS_ORIGINS") {
        config.cors_origins = parse_origins(&v);
    }

    if let Some(v) = env_str("AUTH_MODE") {
        config.auth.mode = v.to_lowercase();
    }
    if let Some(v) = env_str("ORBIT_WEB_JWT_SECRET") {
        config.auth.web_jwt_secret = SecretString::from(v);
    }
    if let Some(v) = env_str("ORBIT_ANCHOR_JWT_SECRET") {
        config.auth.anchor_jwt_secret = SecretString::from(v);
    }
    if let Some(v) = env_parsed::<u64>("ACCESS_TTL_SEC") {
        config.auth.access_ttl_sec = v.max(60);
    }
    if let Some(v) = env_parsed::<u64>("REFRESH_TTL_SEC") {
        config.auth.refresh_ttl_sec = v.max(300);
    }
    if let Some(v) = env_parsed::<u64>("ANCHOR_ACCESS_TTL_SEC") {
        config.auth.anchor_access_ttl_sec = v.max(300);
    }
    if let Some(v) = env_parsed::<u64>("ANCHOR_REFRESH_TTL_SEC") {
        config.auth.anchor_refresh_ttl_sec = v.max(3600);
    }
    if let Some(v) = env_parsed::<u64>("DEVICE_CODE_TTL_SEC") {
        config.auth.device_code_ttl_sec = v.max(60);
    }
    if let Some(v) = env_parsed::<u64>("DEVICE_CODE_POLL_INTERVAL_SEC") {
        config.auth.device_poll_interval_sec = v.max(1);
    }
    if let Some(v) = env_str("DEVICE_VERIFICATION_URL") {
        config.auth.device_verification_url = v;
    }
    if let Some(v) = env_parsed::<u64>("CHALLENGE_TTL_SEC") {
        config.auth.challenge_ttl_sec = v.max(60);
    }
    if let Some(v) = env_str("PASSKEY_ORIGIN") {
        config.auth.passkey_origin = v;
    }
    if let Some(v) = env_str("PASSKEY_RP_ID") {
        config.auth.passkey_rp_id = v;
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_owned()).filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_str(key).and_then(|v| v.parse().ok())
}

fn parse_origins(value: &str) -> Vec<String> {
    let cleaned: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect();
    if cleaned.is_empty() {
        vec!["*".to_owned()]
    } else {
        cleaned
    }
}
