//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Geonames usernames are never stored in the TOML: each credential names
//! either an env var (`username_env`) or a file (`username_file`). When the
//! file lists no credentials at all, `GEONAMES_USERNAMES` (comma separated)
//! supplies them.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use geonames_quota::{Ceilings, Credential, PoolConfig};
use serde::Deserialize;

/// Env var holding comma-separated usernames when no credentials are configured.
pub const USERNAMES_ENV: &str = "GEONAMES_USERNAMES";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Admin API listener. Admin routes are not served at all when unset.
    #[serde(default)]
    pub admin_listen_addr: Option<SocketAddr>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Leases not released within this many seconds expire; their units stay counted.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
}

/// Credential state machine tuning
#[derive(Debug, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_auth_failure_threshold")]
    pub auth_failure_threshold: u32,
    #[serde(default = "default_quota_cooldown")]
    pub quota_cooldown_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            auth_failure_threshold: default_auth_failure_threshold(),
            quota_cooldown_secs: default_quota_cooldown(),
        }
    }
}

impl PoolSettings {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            auth_failure_threshold: self.auth_failure_threshold,
            quota_cooldown: Duration::from_secs(self.quota_cooldown_secs),
        }
    }
}

/// Pool-wide and default per-credential ceilings
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "Ceilings::pool_default")]
    pub pool: Ceilings,
    #[serde(default = "Ceilings::geonames_free_tier")]
    pub credential: Ceilings,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            pool: Ceilings::pool_default(),
            credential: Ceilings::geonames_free_tier(),
        }
    }
}

/// One Geonames account
#[derive(Debug, Deserialize)]
pub struct CredentialConfig {
    pub id: String,
    #[serde(default)]
    pub username_env: Option<String>,
    #[serde(default)]
    pub username_file: Option<PathBuf>,
    /// Overrides `limits.credential` for this account (e.g. a paid account).
    #[serde(default)]
    pub limits: Option<Ceilings>,
    #[serde(skip)]
    pub username: Option<Secret<String>>,
}

fn default_max_connections() -> usize {
    1000
}

fn default_lease_ttl() -> u64 {
    60
}

fn default_auth_failure_threshold() -> u32 {
    2
}

fn default_quota_cooldown() -> u64 {
    3600
}

impl Config {
    /// Load configuration from a TOML file, resolve usernames, validate.
    ///
    /// Username resolution per credential:
    /// 1. `username_env` env var, when set
    /// 2. `username_file` contents
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if config.credentials.is_empty() {
            config.credentials = credentials_from_env();
        } else {
            for credential in &mut config.credentials {
                credential.username = Some(resolve_username(credential)?);
            }
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.server.lease_ttl_secs == 0 {
            return Err(common::Error::Config(
                "lease_ttl_secs must be greater than 0".into(),
            ));
        }
        if self.pool.auth_failure_threshold == 0 {
            return Err(common::Error::Config(
                "auth_failure_threshold must be greater than 0".into(),
            ));
        }
        if self.pool.quota_cooldown_secs == 0 {
            return Err(common::Error::Config(
                "quota_cooldown_secs must be greater than 0".into(),
            ));
        }
        if let Some(admin) = self.server.admin_listen_addr
            && admin == self.server.listen_addr
        {
            return Err(common::Error::Config(format!(
                "admin_listen_addr must differ from listen_addr ({admin})"
            )));
        }

        self.limits
            .pool
            .validate()
            .map_err(|e| common::Error::Config(format!("limits.pool: {e}")))?;
        self.limits
            .credential
            .validate()
            .map_err(|e| common::Error::Config(format!("limits.credential: {e}")))?;

        let mut ids = HashSet::new();
        for credential in &self.credentials {
            if credential.id.trim().is_empty() {
                return Err(common::Error::Config("credential id must not be empty".into()));
            }
            if !ids.insert(credential.id.as_str()) {
                return Err(common::Error::Config(format!(
                    "duplicate credential id: {}",
                    credential.id
                )));
            }
            if credential.username_env.is_none() && credential.username_file.is_none() {
                return Err(common::Error::Config(format!(
                    "credential {} needs username_env or username_file",
                    credential.id
                )));
            }
            if let Some(limits) = &credential.limits {
                limits.validate().map_err(|e| {
                    common::Error::Config(format!("credentials.{}.limits: {e}", credential.id))
                })?;
            }
        }
        Ok(())
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.server.lease_ttl_secs)
    }

    /// Credentials in configured order, with their ceiling overrides.
    /// Entries whose username was not resolved are skipped.
    pub fn pool_credentials(&self) -> Vec<(Credential, Option<Ceilings>)> {
        self.credentials
            .iter()
            .filter_map(|c| {
                let username = c.username.clone()?;
                Some((
                    Credential {
                        id: c.id.clone(),
                        username,
                    },
                    c.limits,
                ))
            })
            .collect()
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("geonames-quota-gateway.toml")
    }
}

fn resolve_username(credential: &CredentialConfig) -> common::Result<Secret<String>> {
    if let Some(var) = &credential.username_env
        && let Ok(value) = std::env::var(var)
    {
        let value = value.trim().to_owned();
        if !value.is_empty() {
            return Ok(Secret::new(value));
        }
    }

    match (&credential.username_file, &credential.username_env) {
        (Some(file), _) => {
            let secret = Secret::from_file(file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read username_file {} for credential {}: {e}",
                    file.display(),
                    credential.id
                ))
            })?;
            if secret.is_empty() {
                return Err(common::Error::Config(format!(
                    "username_file {} for credential {} is empty",
                    file.display(),
                    credential.id
                )));
            }
            Ok(secret)
        }
        (None, Some(var)) => Err(common::Error::MissingEnv { var: var.clone() }),
        (None, None) => Err(common::Error::Config(format!(
            "credential {} needs username_env or username_file",
            credential.id
        ))),
    }
}

/// Build credentials `geonames-1`, `geonames-2`, ... from `GEONAMES_USERNAMES`.
fn credentials_from_env() -> Vec<CredentialConfig> {
    let Ok(raw) = std::env::var(USERNAMES_ENV) else {
        return Vec::new();
    };
    raw.split(',')
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .enumerate()
        .map(|(i, username)| CredentialConfig {
            id: format!("geonames-{}", i + 1),
            username_env: None,
            username_file: None,
            limits: None,
            username: Some(Secret::new(username.to_owned())),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that mutate environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    const MINIMAL: &str = r#"
[server]
listen_addr = "127.0.0.1:8080"
"#;

    #[test]
    fn test_load_minimal_config_uses_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(USERNAMES_ENV) };
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&write_config(&dir, MINIMAL)).unwrap();

        assert_eq!(config.server.max_connections, 1000);
        assert_eq!(config.server.lease_ttl_secs, 60);
        assert!(config.server.admin_listen_addr.is_none());
        assert_eq!(config.pool.auth_failure_threshold, 2);
        assert_eq!(config.pool.quota_cooldown_secs, 3600);
        assert_eq!(config.limits.pool, Ceilings::pool_default());
        assert_eq!(config.limits.credential, Ceilings::geonames_free_tier());
        assert!(config.credentials.is_empty());
    }

    #[test]
    fn test_load_full_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let user_file = dir.path().join("backup_user");
        std::fs::write(&user_file, "backup_account\n").unwrap();

        let toml_content = format!(
            r#"
[server]
listen_addr = "127.0.0.1:8080"
admin_listen_addr = "127.0.0.1:9090"
lease_ttl_secs = 30

[pool]
auth_failure_threshold = 3

[limits.pool]
per_minute = 100

[[credentials]]
id = "primary"
username_env = "GEONAMES_TEST_PRIMARY"

[[credentials]]
id = "backup"
username_file = "{}"

[credentials.limits]
per_hour = 5000
"#,
            user_file.display()
        );
        unsafe { set_env("GEONAMES_TEST_PRIMARY", "primary_account") };
        let config = Config::load(&write_config(&dir, &toml_content)).unwrap();
        unsafe { remove_env("GEONAMES_TEST_PRIMARY") };

        assert_eq!(config.server.lease_ttl_secs, 30);
        assert_eq!(config.pool.auth_failure_threshold, 3);
        assert_eq!(config.limits.pool.per_minute, Some(100));
        assert_eq!(config.limits.pool.per_hour, None);

        let credentials = config.pool_credentials();
        assert_eq!(credentials.len(), 2);
        assert_eq!(credentials[0].0.id, "primary");
        assert_eq!(credentials[0].0.username.expose(), "primary_account");
        assert_eq!(credentials[0].1, None);
        assert_eq!(credentials[1].0.username.expose(), "backup_account");
        assert_eq!(credentials[1].1.unwrap().per_hour, Some(5000));
    }

    #[test]
    fn test_username_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let user_file = dir.path().join("user");
        std::fs::write(&user_file, "from_file").unwrap();

        let toml_content = format!(
            r#"
[server]
listen_addr = "127.0.0.1:8080"

[[credentials]]
id = "a"
username_env = "GEONAMES_TEST_OVERRIDE"
username_file = "{}"
"#,
            user_file.display()
        );
        unsafe { set_env("GEONAMES_TEST_OVERRIDE", "from_env") };
        let config = Config::load(&write_config(&dir, &toml_content)).unwrap();
        unsafe { remove_env("GEONAMES_TEST_OVERRIDE") };

        assert_eq!(
            config.credentials[0].username.as_ref().unwrap().expose(),
            "from_env"
        );
    }

    #[test]
    fn test_missing_username_env_is_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("GEONAMES_TEST_MISSING") };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
listen_addr = "127.0.0.1:8080"

[[credentials]]
id = "a"
username_env = "GEONAMES_TEST_MISSING"
"#,
        );
        let err = Config::load(&path).unwrap_err();
        assert!(
            matches!(err, common::Error::MissingEnv { ref var } if var == "GEONAMES_TEST_MISSING"),
            "got: {err}"
        );
    }

    #[test]
    fn test_nonexistent_username_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
listen_addr = "127.0.0.1:8080"

[[credentials]]
id = "a"
username_file = "/nonexistent/path/user"
"#,
        );
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("failed to read username_file"), "got: {err}");
    }

    #[test]
    fn test_empty_username_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let user_file = dir.path().join("user");
        std::fs::write(&user_file, "  \n").unwrap();
        let path = write_config(
            &dir,
            &format!(
                r#"
[server]
listen_addr = "127.0.0.1:8080"

[[credentials]]
id = "a"
username_file = "{}"
"#,
                user_file.display()
            ),
        );
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("is empty"), "got: {err}");
    }

    #[test]
    fn test_credential_without_source_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
listen_addr = "127.0.0.1:8080"

[[credentials]]
id = "a"
"#,
        );
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("needs username_env or username_file"), "got: {err}");
    }

    #[test]
    fn test_duplicate_credential_ids_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
listen_addr = "127.0.0.1:8080"

[[credentials]]
id = "a"
username_env = "X"

[[credentials]]
id = "a"
username_env = "Y"
"#,
        );
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("duplicate credential id: a"), "got: {err}");
    }

    #[test]
    fn test_zero_ceiling_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
listen_addr = "127.0.0.1:8080"

[limits.credential]
per_hour = 0
"#,
        );
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("limits.credential"), "got: {err}");
        assert!(err.contains("per_hour ceiling must be greater than 0"), "got: {err}");
    }

    #[test]
    fn test_unknown_limit_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
listen_addr = "127.0.0.1:8080"

[limits.pool]
per_week = 10
"#,
        );
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_zero_values_rejected() {
        for (key, section) in [
            ("max_connections", "server"),
            ("lease_ttl_secs", "server"),
            ("auth_failure_threshold", "pool"),
            ("quota_cooldown_secs", "pool"),
        ] {
            let dir = tempfile::tempdir().unwrap();
            let toml_content = if section == "server" {
                format!("[server]\nlisten_addr = \"127.0.0.1:8080\"\n{key} = 0\n")
            } else {
                format!("[server]\nlisten_addr = \"127.0.0.1:8080\"\n\n[pool]\n{key} = 0\n")
            };
            let err = Config::load(&write_config(&dir, &toml_content))
                .unwrap_err()
                .to_string();
            assert!(err.contains(key), "{key} = 0 must be rejected, got: {err}");
        }
    }

    #[test]
    fn test_admin_addr_must_differ() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
listen_addr = "127.0.0.1:8080"
admin_listen_addr = "127.0.0.1:8080"
"#,
        );
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_usernames_env_fallback() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        unsafe { set_env(USERNAMES_ENV, "alpha, beta,,gamma ") };
        let config = Config::load(&write_config(&dir, MINIMAL)).unwrap();
        unsafe { remove_env(USERNAMES_ENV) };

        let credentials = config.pool_credentials();
        let ids: Vec<_> = credentials.iter().map(|(c, _)| c.id.as_str()).collect();
        assert_eq!(ids, vec!["geonames-1", "geonames-2", "geonames-3"]);
        assert_eq!(credentials[2].0.username.expose(), "gamma");
    }

    #[test]
    fn test_config_debug_hides_usernames() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        unsafe { set_env(USERNAMES_ENV, "very_secret_user") };
        let config = Config::load(&write_config(&dir, MINIMAL)).unwrap();
        unsafe { remove_env(USERNAMES_ENV) };

        let debug = format!("{config:?}");
        assert!(!debug.contains("very_secret_user"), "leaked: {debug}");
    }

    #[test]
    fn test_load_missing_file() {
        assert!(Config::load(Path::new("/nonexistent/path/config.toml")).is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");
        assert!(Config::load(&path).is_err());
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
        assert_eq!(path, PathBuf::from("geonames-quota-gateway.toml"));
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
