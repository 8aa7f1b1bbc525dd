//! Layered configuration.
//!
//! Precedence, lowest first: built-in defaults, the TOML file (`objmig.toml` unless
//! `--config` names another), `OBJMIG_`-prefixed environment variables (`__` separates
//! nested keys, e.g. `OBJMIG_DESTINATION__SECRET_KEY`), then CLI overrides.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_FILE: &str = "objmig.toml";
pub const ENV_PREFIX: &str = "OBJMIG_";

const REDACTED: &str = "********";

/// Storage provider behind a configured bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Aliyun OSS through its S3-compatible endpoint.
    Aliyun,
    /// Tencent COS through its S3-compatible endpoint.
    Tencent,
    Minio,
    /// A directory on the local filesystem.
    Local,
}

impl Provider {
    pub fn is_s3(self) -> bool {
        !matches!(self, Self::Local)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Aliyun => "aliyun",
            Self::Tencent => "tencent",
            Self::Minio => "minio",
            Self::Local => "local",
        };
        f.write_str(name)
    }
}

fn default_secure() -> bool {
    true
}

/// Connection settings shared by sources and the destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSettings {
    pub provider: Provider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    /// Scheme for endpoints given without one
    #[serde(default = "default_secure")]
    pub secure: bool,
    /// Directory for the local provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            provider: Provider::Minio,
            endpoint: None,
            region: None,
            bucket: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
            secure: true,
            root: None,
        }
    }
}

impl BackendSettings {
    /// Endpoint URL for S3 providers: the configured one (given a scheme if it has
    /// none), or the provider's regional default.
    pub fn resolved_endpoint(&self) -> Option<String> {
        let scheme = if self.secure { "https" } else { "http" };

        if let Some(endpoint) = self.endpoint.as_deref().filter(|e| !e.is_empty()) {
            return Some(if endpoint.contains("://") {
                endpoint.to_string()
            } else {
                format!("{scheme}://{endpoint}")
            });
        }

        let region = self.region.as_deref().filter(|r| !r.is_empty())?;
        match self.provider {
            Provider::Aliyun => Some(format!("{scheme}://{region}.aliyuncs.com")),
            Provider::Tencent => Some(format!("{scheme}://cos.{region}.myqcloud.com")),
            Provider::Minio | Provider::Local => None,
        }
    }

    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        let invalid = |name: &str, reason: &str| ConfigError::Invalid {
            field: format!("{field}.{name}"),
            reason: reason.to_string(),
        };

        if !self.provider.is_s3() {
            return match &self.root {
                Some(_) => Ok(()),
                None => Err(invalid("root", "required for the local provider")),
            };
        }

        if self.bucket.is_empty() {
            return Err(invalid("bucket", "must not be empty"));
        }
        if self.access_key.is_empty() || self.secret_key.is_empty() {
            return Err(invalid("access_key", "credentials are required"));
        }
        if self.resolved_endpoint().is_none() {
            let reason = match self.provider {
                Provider::Minio => "required for minio",
                _ => "set `endpoint` or `region`",
            };
            return Err(invalid("endpoint", reason));
        }
        Ok(())
    }

    fn redacted(&self) -> Self {
        let mut settings = self.clone();
        if !settings.secret_key.is_empty() {
            settings.secret_key = REDACTED.to_string();
        }
        settings
    }
}

/// A configured source bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSettings {
    #[serde(flatten)]
    pub backend: BackendSettings,
    /// Prepended to destination keys so sources cannot collide.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Parent of the per-source staging directories
    pub staging_root: PathBuf,
    /// Directory holding `<source>_status.json` ledgers
    pub ledger_dir: PathBuf,
    pub concurrency: usize,
    pub verbose: bool,
    pub json_logs: bool,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceSettings>,
    #[serde(default)]
    pub destination: BackendSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            staging_root: PathBuf::from("downloads"),
            ledger_dir: PathBuf::from("."),
            concurrency: 1,
            verbose: false,
            json_logs: false,
            sources: BTreeMap::new(),
            destination: BackendSettings::default(),
        }
    }
}

impl AppConfig {
    /// Load and merge every configuration layer.
    ///
    /// An explicitly named config file must exist; the default one is optional.
    pub fn new<T: Serialize>(
        config_path: Option<&Path>,
        overrides: Option<&T>,
    ) -> Result<Self, ConfigError> {
        let file = match config_path {
            Some(path) if !path.exists() => {
                return Err(ConfigError::Invalid {
                    field: "config".to_string(),
                    reason: format!("{} does not exist", path.display()),
                });
            }
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment.extract()?;
        Ok(config)
    }

    /// Reject settings that cannot work, before any backend is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "concurrency".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        for (name, source) in &self.sources {
            if !is_safe_source_name(name) {
                return Err(ConfigError::Invalid {
                    field: format!("sources.{name}"),
                    reason: "source names must be a single plain path component".to_string(),
                });
            }
            source.backend.validate(&format!("sources.{name}"))?;
        }

        self.destination.validate("destination")
    }

    pub fn source(&self, name: &str) -> Result<&SourceSettings, ConfigError> {
        self.sources
            .get(name)
            .ok_or_else(|| ConfigError::UnknownSource(name.to_string()))
    }

    /// Copy safe to print: secret keys are masked.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        for source in config.sources.values_mut() {
            source.backend = source.backend.redacted();
        }
        config.destination = config.destination.redacted();
        config
    }
}

/// Source names become directory and file names.
fn is_safe_source_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    const SAMPLE: &str = r#"
        concurrency = 4

        [sources.aliyun]
        provider = "aliyun"
        region = "oss-cn-hangzhou"
        bucket = "photos"
        access_key = "ak"
        secret_key = "sk"

        [sources.tencent]
        provider = "tencent"
        region = "ap-guangzhou"
        bucket = "photos-1250000000"
        access_key = "ak"
        secret_key = "sk"
        destination_prefix = "tencent"

        [destination]
        provider = "minio"
        endpoint = "localhost:9000"
        secure = false
        bucket = "archive"
        access_key = "minio"
        secret_key = "minio-secret"
    "#;

    #[test]
    fn test_defaults_without_file() {
        Jail::expect_with(|_jail| {
            let config = AppConfig::new::<()>(None, None).unwrap();
            assert_eq!(config.staging_root, PathBuf::from("downloads"));
            assert_eq!(config.ledger_dir, PathBuf::from("."));
            assert_eq!(config.concurrency, 1);
            assert!(config.sources.is_empty());
            Ok(())
        });
    }

    #[test]
    fn test_file_and_env_layers() {
        Jail::expect_with(|jail| {
            jail.create_file(DEFAULT_CONFIG_FILE, SAMPLE)?;
            jail.set_env("OBJMIG_CONCURRENCY", "8");
            jail.set_env("OBJMIG_DESTINATION__SECRET_KEY", "from-env");

            let config = AppConfig::new::<()>(None, None).unwrap();
            assert_eq!(config.concurrency, 8);
            assert_eq!(config.destination.secret_key, "from-env");
            assert_eq!(config.sources.len(), 2);
            assert_eq!(
                config.sources["tencent"].destination_prefix.as_deref(),
                Some("tencent")
            );
            config.validate().unwrap();
            Ok(())
        });
    }

    #[test]
    fn test_cli_overrides_win() {
        #[derive(Serialize)]
        struct Overrides {
            concurrency: usize,
        }

        Jail::expect_with(|jail| {
            jail.create_file(DEFAULT_CONFIG_FILE, SAMPLE)?;
            jail.set_env("OBJMIG_CONCURRENCY", "8");
            let config = AppConfig::new(None, Some(&Overrides { concurrency: 2 })).unwrap();
            assert_eq!(config.concurrency, 2);
            Ok(())
        });
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        Jail::expect_with(|_jail| {
            let result = AppConfig::new::<()>(Some(Path::new("nope.toml")), None);
            assert!(matches!(result, Err(ConfigError::Invalid { .. })));
            Ok(())
        });
    }

    #[test]
    fn test_provider_endpoint_defaults() {
        let mut settings = BackendSettings {
            provider: Provider::Aliyun,
            region: Some("oss-cn-hangzhou".to_string()),
            ..Default::default()
        };
        assert_eq!(
            settings.resolved_endpoint().as_deref(),
            Some("https://oss-cn-hangzhou.aliyuncs.com")
        );

        settings.provider = Provider::Tencent;
        settings.region = Some("ap-guangzhou".to_string());
        assert_eq!(
            settings.resolved_endpoint().as_deref(),
            Some("https://cos.ap-guangzhou.myqcloud.com")
        );

        settings.provider = Provider::Minio;
        assert_eq!(settings.resolved_endpoint(), None);
        settings.endpoint = Some("minio.local:9000".to_string());
        settings.secure = false;
        assert_eq!(
            settings.resolved_endpoint().as_deref(),
            Some("http://minio.local:9000")
        );
    }

    #[test]
    fn test_validate_rejects_unusable_settings() {
        let mut config = AppConfig {
            destination: BackendSettings {
                provider: Provider::Local,
                root: Some(PathBuf::from("/srv/archive")),
                ..Default::default()
            },
            ..Default::default()
        };
        config.validate().unwrap();

        config.concurrency = 0;
        assert!(config.validate().is_err());
        config.concurrency = 1;

        config.sources.insert(
            "../escape".to_string(),
            SourceSettings {
                backend: BackendSettings {
                    provider: Provider::Local,
                    root: Some(PathBuf::from("/tmp")),
                    ..Default::default()
                },
                destination_prefix: None,
            },
        );
        assert!(config.validate().is_err());
        config.sources.clear();

        config.destination = BackendSettings::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("destination.bucket"));
    }

    #[test]
    fn test_redacted_masks_secrets() {
        Jail::expect_with(|jail| {
            jail.create_file(DEFAULT_CONFIG_FILE, SAMPLE)?;
            let config = AppConfig::new::<()>(None, None).unwrap().redacted();
            assert_eq!(config.destination.secret_key, REDACTED);
            assert_eq!(config.sources["aliyun"].backend.secret_key, REDACTED);
            assert_eq!(config.sources["aliyun"].backend.access_key, "ak");

            let rendered = toml::to_string(&config).unwrap();
            assert!(!rendered.contains("minio-secret"));
            Ok(())
        });
    }
}
