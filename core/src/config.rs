//! Global config singleton. Read the environment once; the server and the
//! supervisor tasks all call `ensure_loaded()` so the first caller does the
//! work, later callers get the same instance.

use std::path::PathBuf;
use std::sync::OnceLock;

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Cached config from `WEBMUX_*` environment variables.
pub struct Config {
    /// TCP bind host. Default: 127.0.0.1.
    pub host: String,
    /// TCP bind port. Default: 7680.
    pub port: u16,
    /// Shared secret. Empty string means auth is disabled and every
    /// connection shares the identity `default`.
    pub auth_token: String,
    /// Working directory for sessions created without a client-supplied cwd.
    pub default_cwd: PathBuf,
    /// Root for the embedded store (webmux.db lives here).
    pub data_dir: PathBuf,
    /// Access-Control-Allow-Origin value. None disables CORS headers.
    pub cors_origin: Option<String>,
    /// Number of proxy hops whose X-Forwarded-For entries are trusted.
    pub trust_proxy: usize,
    /// Cap on simultaneously bound connections per identity.
    pub max_connections_per_identity: usize,
    /// Stale-session reaper threshold.
    pub session_ttl_hours: u64,
    /// REST rate limits, per IP per minute.
    pub read_rate_per_minute: u32,
    pub write_rate_per_minute: u32,
}

/// Ensure config is loaded (idempotent). Reads the environment on first
/// call; returns the same instance afterwards.
pub fn ensure_loaded() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env_string(key) {
        Some(raw) => raw.parse().unwrap_or(default),
        None => default,
    }
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

impl Config {
    fn from_env() -> Self {
        Self {
            host: env_string("WEBMUX_HOST").unwrap_or_else(|| "127.0.0.1".into()),
            port: env_parse("WEBMUX_PORT", 7680),
            auth_token: env_string("WEBMUX_AUTH_TOKEN").unwrap_or_default(),
            default_cwd: env_string("WEBMUX_DEFAULT_CWD")
                .map(PathBuf::from)
                .unwrap_or_else(home_dir),
            data_dir: env_string("WEBMUX_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| home_dir().join(".webmux")),
            cors_origin: env_string("WEBMUX_CORS_ORIGIN"),
            trust_proxy: env_parse("WEBMUX_TRUST_PROXY", 0),
            max_connections_per_identity: env_parse("WEBMUX_MAX_CONNECTIONS_PER_IDENTITY", 10),
            session_ttl_hours: env_parse("WEBMUX_SESSION_TTL_HOURS", 24),
            read_rate_per_minute: env_parse("WEBMUX_READ_RATE_PER_MINUTE", 180),
            write_rate_per_minute: env_parse("WEBMUX_WRITE_RATE_PER_MINUTE", 60),
        }
    }

    /// True when a shared secret is configured.
    pub fn auth_enabled(&self) -> bool {
        !self.auth_token.is_empty()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 7680,
            auth_token: String::new(),
            default_cwd: home_dir(),
            data_dir: home_dir().join(".webmux"),
            cors_origin: None,
            trust_proxy: 0,
            max_connections_per_identity: 10,
            session_ttl_hours: 24,
            read_rate_per_minute: 180,
            write_rate_per_minute: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.port, 7680);
        assert!(!cfg.auth_enabled());
        assert_eq!(cfg.max_connections_per_identity, 10);
        assert_eq!(cfg.session_ttl_hours, 24);
    }

    #[test]
    fn env_parse_falls_back_when_unset() {
        assert_eq!(env_parse("WEBMUX_TEST_UNSET_KEY", 42u16), 42);
    }
}
