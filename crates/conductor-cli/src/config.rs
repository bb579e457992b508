use conductor_core::{ConductorError, ConductorResult};
use conductor_orchestrator::EngineConfig;
use conductor_router::{ProviderConfig, RouterPolicy};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Contents of `conductor.toml`. Every section is optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    /// Directory holding the database.
    pub data_dir: PathBuf,
    /// Legacy JSON key-value cache imported once on first open.
    pub legacy_cache: Option<PathBuf>,
    pub engine: EngineConfig,
    pub router: RouterPolicy,
    pub providers: Vec<ProviderConfig>,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            legacy_cache: None,
            engine: EngineConfig::default(),
            router: RouterPolicy::default(),
            providers: Vec::new(),
        }
    }
}

impl ConductorConfig {
    /// Load `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> ConductorResult<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file; using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        Self::parse(&raw).map_err(|e| match e {
            ConductorError::Config(msg) => {
                ConductorError::Config(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    /// Parse and validate TOML text.
    pub fn parse(raw: &str) -> ConductorResult<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| ConductorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> ConductorResult<()> {
        self.router.validate()?;
        let mut ids = HashSet::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                return Err(ConductorError::Config("provider id must not be empty".into()));
            }
            if !ids.insert(provider.id.as_str()) {
                return Err(ConductorError::Config(format!(
                    "duplicate provider id '{}'",
                    provider.id
                )));
            }
        }
        Ok(())
    }

    /// SQLite database path.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("conductor.db")
    }

    /// Legacy cache path, defaulting to `<data_dir>/cache.json`.
    pub fn legacy_cache_path(&self) -> PathBuf {
        self.legacy_cache
            .clone()
            .unwrap_or_else(|| self.data_dir.join("cache.json"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conductor_router::ProviderKind;

    #[test]
    fn test_missing_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = ConductorConfig::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("./data"));
        assert_eq!(cfg.legacy_cache_path(), PathBuf::from("./data/cache.json"));
        assert_eq!(cfg.engine.cancel_grace_secs, 5);
        assert_eq!(cfg.router.max_attempts, 3);
        assert!(cfg.providers.is_empty());
    }

    #[test]
    fn test_full_file() {
        let cfg = ConductorConfig::parse(
            r#"
            data_dir = "/var/lib/conductor"
            legacy_cache = "/var/lib/old/cache.json"

            [engine]
            step_timeout_secs = 60
            control_poll_ms = 250
            runner_lease_ms = 10000

            [router]
            max_attempts = 2
            quarantine_secs = 60

            [[providers]]
            id = "primary"
            kind = "openai"
            model = "gpt-4o-mini"
            api_key_env = "OPENAI_API_KEY"

            [[providers]]
            id = "backup"
            kind = "anthropic"
            model = "claude-sonnet"
            api_key = "sk-test"
            max_tokens = 1024
            "#,
        )
        .unwrap();

        assert_eq!(cfg.db_path(), PathBuf::from("/var/lib/conductor/conductor.db"));
        assert_eq!(cfg.legacy_cache_path(), PathBuf::from("/var/lib/old/cache.json"));
        assert_eq!(cfg.engine.step_timeout_secs, 60);
        assert_eq!(cfg.engine.cancel_grace_secs, 5);
        assert_eq!(cfg.engine.runner_lease_ms, 10_000);
        assert_eq!(cfg.router.max_attempts, 2);
        assert_eq!(cfg.router.failure_penalty, 15);
        assert_eq!(cfg.providers.len(), 2);
        assert_eq!(cfg.providers[1].kind, ProviderKind::Anthropic);
        assert_eq!(cfg.providers[1].max_tokens, 1024);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(ConductorConfig::parse("[router]\nmax_attempts = 0\n").is_err());
        assert!(ConductorConfig::parse("data_dir = 5\n").is_err());
        let dup = r#"
            [[providers]]
            id = "a"
            kind = "openai"
            model = "m"
            [[providers]]
            id = "a"
            kind = "openai"
            model = "m"
        "#;
        assert!(matches!(
            ConductorConfig::parse(dup),
            Err(ConductorError::Config(_))
        ));
    }

    #[test]
    fn test_load_reports_path_on_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("conductor.toml");
        std::fs::write(&path, "[engine\n").unwrap();
        let err = ConductorConfig::load(&path).unwrap_err().to_string();
        assert!(err.contains("conductor.toml"));
    }
}
