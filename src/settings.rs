use miette::{IntoDiagnostic, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::authz::roles::{RoleOptions, DEFAULT_MAX_DEPTH};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub authz: Authz,
    pub request: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authz {
    /// Model file: request/policy shapes, role definitions, effect, matcher
    pub model_path: PathBuf,
    /// Policy file: `p, ...` rules and `g, ...` role facts
    pub policy_path: PathBuf,
    /// Memoize each member's reachable roles per policy snapshot
    #[serde(default)]
    pub role_cache: bool,
    /// Inheritance hops followed when resolving roles
    #[serde(default = "default_max_role_depth")]
    pub max_role_depth: usize,
}

fn default_max_role_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Subject substituted for an empty one, e.g. an unauthenticated caller
    pub anonymous_subject: String,
}

impl Default for Authz {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("policies/model.conf"),
            policy_path: PathBuf::from("policies/policy.csv"),
            role_cache: false,
            max_role_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl Default for Request {
    fn default() -> Self {
        Self {
            anonymous_subject: "guest".to_string(),
        }
    }
}

impl Authz {
    pub fn role_options(&self) -> RoleOptions {
        RoleOptions {
            max_depth: self.max_role_depth,
            cache: self.role_cache,
        }
    }
}

impl Settings {
    pub fn load(path: &str) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default(
                "authz.model_path",
                Authz::default().model_path.to_string_lossy().to_string(),
            )
            .into_diagnostic()?
            .set_default(
                "authz.policy_path",
                Authz::default().policy_path.to_string_lossy().to_string(),
            )
            .into_diagnostic()?
            .set_default("authz.role_cache", false)
            .into_diagnostic()?
            .set_default("authz.max_role_depth", DEFAULT_MAX_DEPTH as u64)
            .into_diagnostic()?
            .set_default("request.anonymous_subject", Request::default().anonymous_subject)
            .into_diagnostic()?;

        // Optional file
        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment overrides: PATHGUARD__AUTHZ__ROLE_CACHE=true, etc.
        builder =
            builder.add_source(config::Environment::with_prefix("PATHGUARD").separator("__"));

        let cfg = builder.build().into_diagnostic()?;
        let mut s: Settings = cfg.try_deserialize().into_diagnostic()?;

        if s.authz.model_path.is_relative() {
            s.authz.model_path = std::env::current_dir()
                .into_diagnostic()?
                .join(&s.authz.model_path);
        }
        if s.authz.policy_path.is_relative() {
            s.authz.policy_path = std::env::current_dir()
                .into_diagnostic()?
                .join(&s.authz.policy_path);
        }

        Ok(s)
    }

    /// The subject to query with: `subject`, or the anonymous one if empty.
    pub fn subject_or_anonymous<'a>(&'a self, subject: &'a str) -> &'a str {
        if subject.trim().is_empty() {
            &self.request.anonymous_subject
        } else {
            subject
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_settings_load_defaults() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("nonexistent.toml");

        let settings = Settings::load(config_path.to_str().unwrap())
            .expect("Failed to load settings");

        assert!(settings.authz.model_path.ends_with("policies/model.conf"));
        assert!(settings.authz.policy_path.ends_with("policies/policy.csv"));
        assert!(!settings.authz.role_cache);
        assert_eq!(settings.authz.max_role_depth, 10);
        assert_eq!(settings.request.anonymous_subject, "guest");
    }

    #[test]
    fn test_settings_load_from_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("test_config.toml");

        let config_content = r#"
[authz]
model_path = "/etc/pathguard/rbac.conf"
policy_path = "/etc/pathguard/rbac.csv"
role_cache = true
max_role_depth = 4

[request]
anonymous_subject = "anonymous"
"#;
        fs::write(&config_path, config_content).expect("Failed to write config");

        let settings = Settings::load(config_path.to_str().unwrap())
            .expect("Failed to load settings");

        assert_eq!(
            settings.authz.model_path,
            PathBuf::from("/etc/pathguard/rbac.conf")
        );
        assert_eq!(
            settings.authz.policy_path,
            PathBuf::from("/etc/pathguard/rbac.csv")
        );
        assert!(settings.authz.role_cache);
        assert_eq!(settings.authz.max_role_depth, 4);
        assert_eq!(settings.request.anonymous_subject, "anonymous");

        let options = settings.authz.role_options();
        assert_eq!(options.max_depth, 4);
        assert!(options.cache);
    }

    #[test]
    fn test_settings_env_override() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("test_config.toml");

        let config_content = r#"
[request]
anonymous_subject = "nobody"
"#;
        fs::write(&config_path, config_content).expect("Failed to write config");

        env::set_var("PATHGUARD__REQUEST__ANONYMOUS_SUBJECT", "visitor");

        let settings = Settings::load(config_path.to_str().unwrap())
            .expect("Failed to load settings");

        assert_eq!(settings.request.anonymous_subject, "visitor");

        env::remove_var("PATHGUARD__REQUEST__ANONYMOUS_SUBJECT");
    }

    #[test]
    fn test_settings_path_normalization() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("test_config.toml");

        let config_content = r#"
[authz]
model_path = "relative/model.conf"
policy_path = "relative/policy.csv"
"#;
        fs::write(&config_path, config_content).expect("Failed to write config");

        let settings = Settings::load(config_path.to_str().unwrap())
            .expect("Failed to load settings");

        assert!(settings.authz.model_path.is_absolute());
        assert!(settings.authz.policy_path.is_absolute());
        assert!(settings.authz.model_path.ends_with("relative/model.conf"));
        assert!(settings.authz.policy_path.ends_with("relative/policy.csv"));
        // unset keys in a present table keep their defaults
        assert_eq!(settings.authz.max_role_depth, DEFAULT_MAX_DEPTH);
    }

    #[test]
    fn test_subject_or_anonymous() {
        let settings = Settings::default();
        assert_eq!(settings.subject_or_anonymous("alice"), "alice");
        assert_eq!(settings.subject_or_anonymous(""), "guest");
        assert_eq!(settings.subject_or_anonymous("  "), "guest");
    }
}
