//! Startup configuration: a TOML document overlaid with `SSM_*` environment variables.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{
    backend::SlotId,
    error::{SsmError, SsmResult},
    secret::SecretString,
};

pub const DEFAULT_MAX_SESSIONS: usize = 10;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Pkcs11,
    Soft,
}

impl std::str::FromStr for BackendKind {
    type Err = SsmError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "pkcs11" => Ok(Self::Pkcs11),
            "soft" => Ok(Self::Soft),
            other => Err(SsmError::config(format!("unknown token backend {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TokenConfig {
    pub backend: BackendKind,
    /// Path to the vendor PKCS#11 shared library.
    pub module_path: Option<PathBuf>,
    pub slot: SlotId,
    pub pin: SecretString,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    pub max_sessions: usize,
    /// Seconds to wait for a free session; 0 waits forever.
    pub acquire_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            acquire_timeout_secs: DEFAULT_ACQUIRE_TIMEOUT_SECS,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Option<Duration> {
        (self.acquire_timeout_secs > 0).then(|| Duration::from_secs(self.acquire_timeout_secs))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuditConfig {
    /// JSON-lines audit file. Entries are kept in memory when unset.
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SsmConfig {
    pub token: TokenConfig,
    pub pool: PoolConfig,
    pub audit: AuditConfig,
}

impl SsmConfig {
    /// Read `path`, apply the process environment and validate.
    pub fn load(path: impl AsRef<Path>) -> SsmResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|err| SsmError::config(format!("{}: {err}", path.display())))?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with the process environment, for runs without a config file.
    pub fn from_env() -> SsmResult<Self> {
        let mut config = Self::default();
        config.apply_env(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> SsmResult<Self> {
        toml::from_str(content).map_err(SsmError::config)
    }

    /// Override fields from `SSM_*` variables.
    ///
    /// Precedence is defaults, then the TOML file, then the environment: a variable that is
    /// set replaces the file value even when the file sets the field. Unset variables leave the
    /// field alone, and an empty `SSM_PIN` is applied and then rejected by [`Self::validate`].
    /// Names outside the table below are ignored.
    ///
    /// | variable            | field               |
    /// |---------------------|---------------------|
    /// | `SSM_BACKEND`       | `token.backend`     |
    /// | `SSM_PKCS11_MODULE` | `token.module_path` |
    /// | `SSM_SLOT`          | `token.slot`        |
    /// | `SSM_PIN`           | `token.pin`         |
    /// | `SSM_MAX_SESSIONS`  | `pool.max_sessions` |
    /// | `SSM_AUDIT_LOG`     | `audit.log_path`    |
    pub fn apply_env<I>(&mut self, vars: I) -> SsmResult<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .filter(|(name, _)| name.starts_with("SSM_"))
            .collect();
        if let Some(value) = vars.get("SSM_BACKEND") {
            self.token.backend = value.parse()?;
        }
        if let Some(value) = vars.get("SSM_PKCS11_MODULE") {
            self.token.module_path = Some(PathBuf::from(value));
        }
        if let Some(value) = vars.get("SSM_SLOT") {
            self.token.slot = parse_number("SSM_SLOT", value)?;
        }
        if let Some(value) = vars.get("SSM_PIN") {
            self.token.pin = SecretString::new(value.as_str());
        }
        if let Some(value) = vars.get("SSM_MAX_SESSIONS") {
            self.pool.max_sessions = parse_number("SSM_MAX_SESSIONS", value)?;
        }
        if let Some(value) = vars.get("SSM_AUDIT_LOG") {
            self.audit.log_path = Some(PathBuf::from(value));
        }
        Ok(())
    }

    pub fn validate(&self) -> SsmResult<()> {
        if self.pool.max_sessions == 0 {
            return Err(SsmError::config("pool.max_sessions must be at least 1"));
        }
        if self.token.pin.is_empty() {
            return Err(SsmError::config("token.pin must not be empty"));
        }
        if self.token.backend == BackendKind::Pkcs11 && self.token.module_path.is_none() {
            return Err(SsmError::config(
                "token.module_path is required for the pkcs11 backend",
            ));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> SsmResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SsmError::config(format!("{name} must be a number, got {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [token]
        backend = "pkcs11"
        module_path = "/usr/lib/softhsm/libsofthsm2.so"
        slot = 3
        pin = "1234"

        [pool]
        max_sessions = 4
    "#;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_file_with_defaults() {
        let config = SsmConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.token.slot, 3);
        assert_eq!(config.token.pin.expose(), "1234");
        assert_eq!(config.pool.max_sessions, 4);
        assert_eq!(config.pool.acquire_timeout(), Some(Duration::from_secs(30)));
        assert!(config.audit.log_path.is_none());
        config.validate().unwrap();
        assert!(!format!("{config:?}").contains("1234"));
    }

    #[test]
    fn environment_overrides_file() {
        let mut config = SsmConfig::from_toml(SAMPLE).unwrap();
        config
            .apply_env(env(&[
                ("SSM_BACKEND", "soft"),
                ("SSM_SLOT", "7"),
                ("SSM_PIN", "9999"),
                ("SSM_MAX_SESSIONS", "2"),
                ("SSM_AUDIT_LOG", "/tmp/audit.jsonl"),
                ("HOME", "/root"),
            ]))
            .unwrap();
        assert_eq!(config.token.backend, BackendKind::Soft);
        assert_eq!(config.token.slot, 7);
        assert_eq!(config.token.pin.expose(), "9999");
        assert_eq!(config.pool.max_sessions, 2);
        assert_eq!(config.audit.log_path, Some(PathBuf::from("/tmp/audit.jsonl")));
    }

    #[test]
    fn unset_variables_keep_file_values() {
        let mut config = SsmConfig::from_toml(SAMPLE).unwrap();
        config.apply_env(env(&[("SSM_SLOT", "5")])).unwrap();
        assert_eq!(config.token.slot, 5);
        assert_eq!(config.token.backend, BackendKind::Pkcs11);
        assert_eq!(config.pool.max_sessions, 4);
        assert_eq!(config.token.pin.expose(), "1234");

        config.apply_env(env(&[("SSM_PIN", "")])).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = SsmConfig::from_toml(SAMPLE).unwrap();
        assert!(config.apply_env(env(&[("SSM_SLOT", "three")])).is_err());
        assert!(config.apply_env(env(&[("SSM_BACKEND", "hsm")])).is_err());

        config.pool.max_sessions = 0;
        assert!(matches!(config.validate(), Err(SsmError::Config(_))));

        let missing_module = SsmConfig::from_toml("[token]\npin = \"1\"").unwrap();
        assert!(missing_module.validate().is_err());

        let soft = SsmConfig::from_toml("[token]\nbackend = \"soft\"\npin = \"1\"").unwrap();
        soft.validate().unwrap();
        assert!(SsmConfig::from_toml("[token]\nbackend = \"soft\"").unwrap().validate().is_err());
        assert!(SsmConfig::from_toml("[tokens]\n").is_err());
    }

    #[test]
    fn zero_timeout_waits_forever() {
        let config = SsmConfig::from_toml("[pool]\nacquire_timeout_secs = 0").unwrap();
        assert_eq!(config.pool.acquire_timeout(), None);
    }

    #[test]
    fn loads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[token]\nbackend = \"soft\"\npin = \"4321\"\n").unwrap();
        let config = SsmConfig::load(file.path()).unwrap();
        assert_eq!(config.token.backend, BackendKind::Soft);
        assert!(SsmConfig::load("/nonexistent/ssm.toml").is_err());
    }
}
