//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys are loaded from env vars or key files, never stored in the
//! TOML directly to avoid leaking secrets.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub pool: PoolSection,
    #[serde(default)]
    pub replenish: ReplenishSection,
    #[serde(default)]
    pub refresh: RefreshSection,
    pub identity: IdentitySection,
}

/// HTTP control API settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Pool sizing and lease behavior
#[derive(Debug, Deserialize)]
pub struct PoolSection {
    pub store_path: PathBuf,
    #[serde(default = "default_min_size")]
    pub min_size: usize,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default = "default_accounts_per_request")]
    pub accounts_per_request: usize,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_refresh_floor_secs")]
    pub refresh_floor_secs: u64,
    #[serde(default = "default_degraded_retry_threshold")]
    pub degraded_retry_threshold: u32,
    #[serde(default = "default_stuck_grace_secs")]
    pub stuck_grace_secs: u64,
    #[serde(default)]
    pub allocation_policy: account_pool::AllocationPolicy,
}

/// Background replenishment settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ReplenishSection {
    pub interval_secs: u64,
    pub registration_deadline_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    pub max_attempts: u32,
}

impl Default for ReplenishSection {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            registration_deadline_secs: 180,
            backoff_base_secs: 2,
            backoff_cap_secs: 60,
            max_attempts: 5,
        }
    }
}

/// Background token refresh settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RefreshSection {
    pub interval_secs: u64,
    /// Tokens expiring within this window are renewed proactively
    pub margin_secs: u64,
    /// Per-refresh HTTP deadline
    pub deadline_secs: u64,
}

impl Default for RefreshSection {
    fn default() -> Self {
        Self {
            interval_secs: 600,
            margin_secs: 900,
            deadline_secs: 30,
        }
    }
}

/// Identity provider and mailbox settings
#[derive(Debug, Deserialize)]
pub struct IdentitySection {
    #[serde(skip)]
    pub firebase_api_key: Option<Secret<String>>,
    #[serde(default)]
    pub firebase_api_key_file: Option<PathBuf>,
    #[serde(skip)]
    pub mailbox_api_key: Option<Secret<String>>,
    #[serde(default)]
    pub mailbox_api_key_file: Option<PathBuf>,
    #[serde(default = "default_challenge_timeout_secs")]
    pub challenge_timeout_secs: u64,
    /// Mailbox sources tried in order; later entries are fallbacks
    pub sources: Vec<MailboxSource>,
}

/// One mailbox provider endpoint with the email domains it serves
#[derive(Debug, Clone, Deserialize)]
pub struct MailboxSource {
    pub name: String,
    pub base_url: String,
    pub domains: Vec<String>,
}

fn default_max_connections() -> usize {
    1000
}

fn default_min_size() -> usize {
    5
}

fn default_max_size() -> usize {
    20
}

fn default_accounts_per_request() -> usize {
    1
}

fn default_lease_ttl_secs() -> u64 {
    1_800
}

fn default_refresh_floor_secs() -> u64 {
    3_600
}

fn default_degraded_retry_threshold() -> u32 {
    3
}

fn default_stuck_grace_secs() -> u64 {
    600
}

fn default_challenge_timeout_secs() -> u64 {
    120
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment
    /// variables.
    ///
    /// Secret resolution order for each key:
    /// 1. FIREBASE_API_KEY / MAILBOX_API_KEY env var
    /// 2. *_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if config.pool.max_size == 0 {
            return Err(common::Error::Config(
                "max_size must be greater than 0".into(),
            ));
        }
        if config.pool.min_size > config.pool.max_size {
            return Err(common::Error::Config(format!(
                "min_size ({}) must not exceed max_size ({})",
                config.pool.min_size, config.pool.max_size
            )));
        }
        if config.pool.accounts_per_request == 0 {
            return Err(common::Error::Config(
                "accounts_per_request must be greater than 0".into(),
            ));
        }
        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if config.identity.sources.is_empty() {
            return Err(common::Error::Config(
                "at least one [[identity.sources]] entry is required".into(),
            ));
        }
        for source in &config.identity.sources {
            if !source.base_url.starts_with("http://") && !source.base_url.starts_with("https://")
            {
                return Err(common::Error::Config(format!(
                    "source {} base_url must start with http:// or https://, got: {}",
                    source.name, source.base_url
                )));
            }
            if source.domains.is_empty() {
                return Err(common::Error::Config(format!(
                    "source {} must list at least one domain",
                    source.name
                )));
            }
        }

        apply_env_overrides(&mut config)?;

        config.identity.firebase_api_key = resolve_secret(
            "FIREBASE_API_KEY",
            config.identity.firebase_api_key_file.as_deref(),
        )?;
        config.identity.mailbox_api_key = resolve_secret(
            "MAILBOX_API_KEY",
            config.identity.mailbox_api_key_file.as_deref(),
        )?;
        if config.identity.firebase_api_key.is_none() {
            return Err(common::Error::Config(
                "firebase API key missing: set FIREBASE_API_KEY or firebase_api_key_file".into(),
            ));
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("warp-pool-service.toml")
    }
}

/// Env var takes precedence over the key file.
fn resolve_secret(env_var: &str, file: Option<&Path>) -> common::Result<Option<Secret<String>>> {
    if let Ok(key) = std::env::var(env_var) {
        return Ok(Some(Secret::new(key)));
    }
    if let Some(path) = file {
        let key = std::fs::read_to_string(path).map_err(|e| {
            common::Error::Config(format!("failed to read key file {}: {e}", path.display()))
        })?;
        let key = key.trim().to_owned();
        if !key.is_empty() {
            return Ok(Some(Secret::new(key)));
        }
    }
    Ok(None)
}

/// Numeric pool knobs can be overridden per deployment without editing the
/// TOML.
fn apply_env_overrides(config: &mut Config) -> common::Result<()> {
    if let Some(v) = env_parse::<usize>("POOL_MIN_SIZE")? {
        config.pool.min_size = v;
    }
    if let Some(v) = env_parse::<usize>("POOL_MAX_SIZE")? {
        config.pool.max_size = v;
    }
    if let Some(v) = env_parse::<usize>("ACCOUNTS_PER_REQUEST")? {
        config.pool.accounts_per_request = v;
    }
    if let Some(v) = env_parse::<u64>("REFRESH_FLOOR_SECS")? {
        config.pool.refresh_floor_secs = v;
    }
    if let Some(v) = env_parse::<u64>("LEASE_TTL_SECS")? {
        config.pool.lease_ttl_secs = v;
    }
    if let Some(v) = env_parse::<u32>("DEGRADED_RETRY_THRESHOLD")? {
        config.pool.degraded_retry_threshold = v;
    }
    if config.pool.min_size > config.pool.max_size {
        return Err(common::Error::Env(format!(
            "POOL_MIN_SIZE ({}) must not exceed POOL_MAX_SIZE ({})",
            config.pool.min_size, config.pool.max_size
        )));
    }
    Ok(())
}

fn env_parse<T: std::str::FromStr>(var: &str) -> common::Result<Option<T>> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| common::Error::Env(format!("{var} has invalid value: {raw:?}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn clear_pool_env() {
        for var in [
            "FIREBASE_API_KEY",
            "MAILBOX_API_KEY",
            "POOL_MIN_SIZE",
            "POOL_MAX_SIZE",
            "ACCOUNTS_PER_REQUEST",
            "REFRESH_FLOOR_SECS",
            "LEASE_TTL_SECS",
            "DEGRADED_RETRY_THRESHOLD",
        ] {
            unsafe { remove_env(var) };
        }
    }

    fn valid_toml() -> &'static str {
        r#"
[server]
listen_addr = "127.0.0.1:8088"

[pool]
store_path = "/var/lib/warp-pool/accounts.json"
min_size = 3
max_size = 10

[identity]

[[identity.sources]]
name = "primary"
base_url = "https://mail.example.com"
domains = ["example.com", "example.org"]

[[identity.sources]]
name = "fallback"
base_url = "https://backup-mail.example.net"
domains = ["example.net"]
"#
    }

    fn write_config(dir_name: &str, contents: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(dir_name);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_valid_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_pool_env();
        unsafe { set_env("FIREBASE_API_KEY", "fb-key-1") };
        let (dir, path) = write_config("pool-service-test-valid", valid_toml());

        let config = Config::load(&path).unwrap();
        assert_eq!(config.pool.min_size, 3);
        assert_eq!(config.pool.max_size, 10);
        // Defaults fill unspecified fields
        assert_eq!(config.pool.accounts_per_request, 1);
        assert_eq!(config.pool.lease_ttl_secs, 1_800);
        assert_eq!(config.pool.refresh_floor_secs, 3_600);
        assert_eq!(config.replenish.interval_secs, 300);
        assert_eq!(config.refresh.margin_secs, 900);
        assert_eq!(config.identity.sources.len(), 2);
        assert_eq!(config.identity.sources[1].name, "fallback");
        assert_eq!(
            config.identity.firebase_api_key.as_ref().unwrap().expose(),
            "fb-key-1"
        );
        assert!(config.identity.mailbox_api_key.is_none());

        unsafe { remove_env("FIREBASE_API_KEY") };
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let (dir, path) = write_config("pool-service-test-invalid", "not valid {{{{ toml");
        let result = Config::load(&path);
        assert!(result.is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_min_size_exceeding_max_size_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_pool_env();
        unsafe { set_env("FIREBASE_API_KEY", "fb-key-1") };
        let toml_content = r#"
[server]
listen_addr = "127.0.0.1:8088"

[pool]
store_path = "/tmp/accounts.json"
min_size = 10
max_size = 5

[identity]

[[identity.sources]]
name = "primary"
base_url = "https://mail.example.com"
domains = ["example.com"]
"#;
        let (dir, path) = write_config("pool-service-test-minmax", toml_content);
        let result = Config::load(&path);
        assert!(result.is_err(), "min_size > max_size must be rejected");
        unsafe { remove_env("FIREBASE_API_KEY") };
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_firebase_key_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_pool_env();
        let (dir, path) = write_config("pool-service-test-nokey", valid_toml());
        let result = Config::load(&path);
        assert!(result.is_err(), "missing firebase API key must be rejected");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_firebase_key_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_pool_env();
        let dir = std::env::temp_dir().join("pool-service-test-keyfile");
        std::fs::create_dir_all(&dir).unwrap();
        let key_path = dir.join("firebase_key");
        std::fs::write(&key_path, "fb-from-file\n").unwrap();

        let toml_content = format!(
            r#"
[server]
listen_addr = "127.0.0.1:8088"

[pool]
store_path = "/tmp/accounts.json"

[identity]
firebase_api_key_file = "{}"

[[identity.sources]]
name = "primary"
base_url = "https://mail.example.com"
domains = ["example.com"]
"#,
            key_path.display()
        );
        let path = dir.join("config.toml");
        std::fs::write(&path, &toml_content).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.identity.firebase_api_key.as_ref().unwrap().expose(),
            "fb-from-file"
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_env_key_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_pool_env();
        let dir = std::env::temp_dir().join("pool-service-test-key-override");
        std::fs::create_dir_all(&dir).unwrap();
        let key_path = dir.join("firebase_key");
        std::fs::write(&key_path, "fb-from-file").unwrap();

        let toml_content = format!(
            r#"
[server]
listen_addr = "127.0.0.1:8088"

[pool]
store_path = "/tmp/accounts.json"

[identity]
firebase_api_key_file = "{}"

[[identity.sources]]
name = "primary"
base_url = "https://mail.example.com"
domains = ["example.com"]
"#,
            key_path.display()
        );
        let path = dir.join("config.toml");
        std::fs::write(&path, &toml_content).unwrap();

        unsafe { set_env("FIREBASE_API_KEY", "fb-from-env") };
        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.identity.firebase_api_key.as_ref().unwrap().expose(),
            "fb-from-env"
        );
        unsafe { remove_env("FIREBASE_API_KEY") };

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_pool_env_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_pool_env();
        unsafe { set_env("FIREBASE_API_KEY", "fb-key-1") };
        unsafe { set_env("POOL_MIN_SIZE", "7") };
        unsafe { set_env("POOL_MAX_SIZE", "30") };
        unsafe { set_env("LEASE_TTL_SECS", "900") };
        let (dir, path) = write_config("pool-service-test-env-overrides", valid_toml());

        let config = Config::load(&path).unwrap();
        assert_eq!(config.pool.min_size, 7);
        assert_eq!(config.pool.max_size, 30);
        assert_eq!(config.pool.lease_ttl_secs, 900);

        clear_pool_env();
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_unparseable_env_override_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_pool_env();
        unsafe { set_env("FIREBASE_API_KEY", "fb-key-1") };
        unsafe { set_env("POOL_MIN_SIZE", "lots") };
        let (dir, path) = write_config("pool-service-test-bad-env", valid_toml());

        let result = Config::load(&path);
        assert!(result.is_err(), "non-numeric POOL_MIN_SIZE must be rejected");

        clear_pool_env();
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_no_sources_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_pool_env();
        unsafe { set_env("FIREBASE_API_KEY", "fb-key-1") };
        let toml_content = r#"
[server]
listen_addr = "127.0.0.1:8088"

[pool]
store_path = "/tmp/accounts.json"

[identity]
sources = []
"#;
        let (dir, path) = write_config("pool-service-test-nosources", toml_content);
        let result = Config::load(&path);
        assert!(result.is_err(), "empty identity.sources must be rejected");
        unsafe { remove_env("FIREBASE_API_KEY") };
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_source_without_scheme_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_pool_env();
        unsafe { set_env("FIREBASE_API_KEY", "fb-key-1") };
        let toml_content = r#"
[server]
listen_addr = "127.0.0.1:8088"

[pool]
store_path = "/tmp/accounts.json"

[identity]

[[identity.sources]]
name = "primary"
base_url = "mail.example.com"
domains = ["example.com"]
"#;
        let (dir, path) = write_config("pool-service-test-badurl", toml_content);
        let result = Config::load(&path);
        assert!(result.is_err(), "base_url without scheme must be rejected");
        unsafe { remove_env("FIREBASE_API_KEY") };
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_allocation_policy_parses() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_pool_env();
        unsafe { set_env("FIREBASE_API_KEY", "fb-key-1") };
        let toml_content = r#"
[server]
listen_addr = "127.0.0.1:8088"

[pool]
store_path = "/tmp/accounts.json"
allocation_policy = "all_or_nothing"

[identity]

[[identity.sources]]
name = "primary"
base_url = "https://mail.example.com"
domains = ["example.com"]
"#;
        let (dir, path) = write_config("pool-service-test-policy", toml_content);
        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.pool.allocation_policy,
            account_pool::AllocationPolicy::AllOrNothing
        );
        unsafe { remove_env("FIREBASE_API_KEY") };
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("warp-pool-service.toml"));
    }

    #[test]
    fn test_resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(path, PathBuf::from("/cli/wins.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }
}
