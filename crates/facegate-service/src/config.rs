use std::path::{Path, PathBuf};

use facegate_core::Policy;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read policy file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid policy file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid policy: {0}")]
    Invalid(String),
}

/// Service configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database holding enrolled embeddings.
    pub db_path: PathBuf,
    /// SQLite database holding `users` and `badges`.
    pub credentials_db: PathBuf,
    /// SQLite database receiving the access log.
    pub audit_db: PathBuf,
    /// Length every stored embedding must have.
    pub embedding_dim: usize,
    /// Upper bound in seconds for one verify call.
    pub verify_timeout_secs: u64,
    /// Optional TOML file overriding policy constants.
    pub policy_file: Option<PathBuf>,
    /// Overrides `matching.nominal_threshold`.
    pub match_threshold: Option<f32>,
    /// Overrides `matching.accept_threshold`.
    pub accept_threshold: Option<f32>,
    /// Overrides `precedence.liveness_supersedes_spoof`.
    pub liveness_supersedes_spoof: Option<bool>,
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = get("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = get("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facegate");

        let path = |key: &str, file: &str| {
            get(key)
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join(file))
        };

        Self {
            db_path: path("FACEGATE_DB_PATH", "faces.db"),
            credentials_db: path("FACEGATE_CREDENTIALS_DB", "access.db"),
            audit_db: path("FACEGATE_AUDIT_DB", "access.db"),
            embedding_dim: parse_or(get("FACEGATE_EMBEDDING_DIM"), 128),
            verify_timeout_secs: parse_or(get("FACEGATE_VERIFY_TIMEOUT_SECS"), 10),
            policy_file: get("FACEGATE_POLICY_FILE").map(PathBuf::from),
            match_threshold: get("FACEGATE_MATCH_THRESHOLD").and_then(|v| v.parse().ok()),
            accept_threshold: get("FACEGATE_ACCEPT_THRESHOLD").and_then(|v| v.parse().ok()),
            liveness_supersedes_spoof: get("FACEGATE_LIVENESS_SUPERSEDES_SPOOF")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false")),
        }
    }

    /// Build the decision policy: defaults, then the policy file (if any),
    /// then the individual environment overrides.
    pub fn load_policy(&self) -> Result<Policy, ConfigError> {
        let mut policy = match &self.policy_file {
            Some(path) => read_policy_file(path)?,
            None => Policy::default(),
        };

        if let Some(v) = self.match_threshold {
            policy.matching.nominal_threshold = v;
        }
        if let Some(v) = self.accept_threshold {
            policy.matching.accept_threshold = v;
        }
        if let Some(v) = self.liveness_supersedes_spoof {
            policy.precedence.liveness_supersedes_spoof = v;
        }

        validate(&policy)?;

        if !policy.precedence.liveness_supersedes_spoof {
            tracing::info!("spoof check runs even after liveness passes");
        }
        Ok(policy)
    }
}

fn read_policy_file(path: &Path) -> Result<Policy, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let policy = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(path = %path.display(), "loaded policy file");
    Ok(policy)
}

fn validate(policy: &Policy) -> Result<(), ConfigError> {
    let liveness = &policy.liveness;
    if liveness.min_frames == 0 || liveness.min_frames > liveness.max_frames {
        return Err(ConfigError::Invalid(format!(
            "liveness frame window {}..={} is empty",
            liveness.min_frames, liveness.max_frames
        )));
    }
    if liveness.ear_closed >= liveness.ear_open {
        return Err(ConfigError::Invalid(format!(
            "closed-eye EAR {} must be below open-eye EAR {}",
            liveness.ear_closed, liveness.ear_open
        )));
    }
    let spectrum = policy.spoof.spectrum_size;
    if !spectrum.is_power_of_two() {
        return Err(ConfigError::Invalid(format!(
            "spectrum size {spectrum} is not a power of two"
        )));
    }
    let matching = &policy.matching;
    if !matching.nominal_threshold.is_finite()
        || !matching.tolerance.is_finite()
        || !matching.accept_threshold.is_finite()
    {
        return Err(ConfigError::Invalid("match thresholds must be finite".into()));
    }
    Ok(())
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[("HOME", "/home/guard")]);
        assert_eq!(
            cfg.db_path,
            PathBuf::from("/home/guard/.local/share/facegate/faces.db")
        );
        assert_eq!(cfg.embedding_dim, 128);
        assert_eq!(cfg.verify_timeout_secs, 10);
        assert!(cfg.policy_file.is_none());
        assert_eq!(cfg.load_policy().unwrap(), Policy::default());
    }

    #[test]
    fn test_explicit_paths_and_bad_numbers() {
        let cfg = config(&[
            ("FACEGATE_DB_PATH", "/srv/faces.db"),
            ("FACEGATE_AUDIT_DB", "/srv/audit.db"),
            ("FACEGATE_EMBEDDING_DIM", "not-a-number"),
        ]);
        assert_eq!(cfg.db_path, PathBuf::from("/srv/faces.db"));
        assert_eq!(cfg.audit_db, PathBuf::from("/srv/audit.db"));
        assert_eq!(cfg.embedding_dim, 128);
    }

    #[test]
    fn test_env_overrides_policy() {
        let cfg = config(&[
            ("FACEGATE_MATCH_THRESHOLD", "0.6"),
            ("FACEGATE_ACCEPT_THRESHOLD", "0.7"),
            ("FACEGATE_LIVENESS_SUPERSEDES_SPOOF", "false"),
        ]);
        let policy = cfg.load_policy().unwrap();
        assert_eq!(policy.matching.nominal_threshold, 0.6);
        assert_eq!(policy.matching.accept_threshold, 0.7);
        assert!(!policy.precedence.liveness_supersedes_spoof);
    }

    #[test]
    fn test_policy_file_partial_override() {
        let dir = std::env::temp_dir().join(format!(
            "facegate-config-test-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("policy.toml");
        std::fs::write(
            &path,
            "[liveness]\nmin_frames = 4\n\n[matching]\ntolerance = 0.05\n",
        )
        .unwrap();

        let cfg = config(&[("FACEGATE_POLICY_FILE", path.to_str().unwrap())]);
        let policy = cfg.load_policy().unwrap();
        assert_eq!(policy.liveness.min_frames, 4);
        assert_eq!(policy.liveness.max_frames, 6);
        assert_eq!(policy.matching.tolerance, 0.05);
        assert_eq!(policy.spoof, Policy::default().spoof);
    }

    #[test]
    fn test_missing_policy_file() {
        let cfg = config(&[("FACEGATE_POLICY_FILE", "/nonexistent/facegate/policy.toml")]);
        assert!(matches!(cfg.load_policy(), Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let mut policy = Policy::default();
        policy.liveness.ear_closed = 0.3;
        assert!(matches!(validate(&policy), Err(ConfigError::Invalid(_))));

        let mut policy = Policy::default();
        policy.spoof.spectrum_size = 200;
        assert!(matches!(validate(&policy), Err(ConfigError::Invalid(_))));
    }
}
