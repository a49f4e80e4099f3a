use ahash::AHashSet;
use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_BASE_FOLDER: &str = "HCS";
const DEFAULT_BACKEND_TIMEOUT_SECS: u64 = 30;
const DEFAULT_FTPS_PORT: u16 = 21;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Subfolder every backend is restricted to.
    #[serde(default = "default_base_folder")]
    pub base_folder: String,
    #[serde(default = "default_backend_timeout_secs")]
    pub backend_timeout_secs: u64,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub sensitivity: SensitivityConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            base_folder: default_base_folder(),
            backend_timeout_secs: default_backend_timeout_secs(),
            ignore_patterns: Vec::new(),
            backends: Vec::new(),
            classifier: ClassifierConfig::default(),
            sensitivity: SensitivityConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs.max(1))
    }

    /// Backend ids key every descriptor and location, so they must be unique.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = AHashSet::new();
        for backend in &self.backends {
            if backend.id().is_empty() {
                return Err(ConfigError::Message("backend id must not be empty".to_string()));
            }
            if !seen.insert(backend.id()) {
                return Err(ConfigError::Message(format!(
                    "duplicate backend id '{}'",
                    backend.id()
                )));
            }
        }
        Ok(())
    }
}

/// Connection parameters for one backend, selected by `kind`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Local {
        id: String,
        root: String,
    },
    Ftps {
        id: String,
        host: String,
        #[serde(default = "default_ftps_port")]
        port: u16,
        user: String,
        password: Secret,
    },
    Cloud {
        id: String,
        access_token: Secret,
    },
}

impl BackendConfig {
    pub fn id(&self) -> &str {
        match self {
            BackendConfig::Local { id, .. }
            | BackendConfig::Ftps { id, .. }
            | BackendConfig::Cloud { id, .. } => id,
        }
    }
}

/// A credential that never shows up in `Debug` output or logs.
#[derive(Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("Secret(<empty>)")
        } else {
            f.write_str("Secret(***)")
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClassifierConfig {
    /// JSON model artifact; the built-in model is used when absent.
    pub model_path: Option<String>,
    /// Overrides the artifact's decision threshold.
    pub threshold: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensitivityConfig {
    /// JSON file with `sensitive_keywords` and `sensitive_extensions`.
    pub keywords_path: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Also match keywords against the sampled text of text files.
    #[serde(default = "default_scan_content")]
    pub scan_content: bool,
}

impl Default for SensitivityConfig {
    fn default() -> Self {
        Self {
            keywords_path: None,
            keywords: Vec::new(),
            extensions: Vec::new(),
            scan_content: default_scan_content(),
        }
    }
}

fn default_base_folder() -> String {
    DEFAULT_BASE_FOLDER.to_string()
}

fn default_backend_timeout_secs() -> u64 {
    DEFAULT_BACKEND_TIMEOUT_SECS
}

fn default_scan_content() -> bool {
    true
}

fn default_ftps_port() -> u16 {
    DEFAULT_FTPS_PORT
}

/// Load `Config.toml` (or the file named by `FILERECON_CONFIG`) with
/// `FILERECON__*` environment overrides. When no backend is configured the
/// set is derived from the legacy environment variables.
pub fn load_configuration() -> Result<AppConfig, ConfigError> {
    let config_name = env::var("FILERECON_CONFIG").unwrap_or_else(|_| "Config".to_string());
    let builder = Config::builder()
        .add_source(ConfigFile::with_name(&config_name).required(false))
        .add_source(Environment::with_prefix("FILERECON").separator("__"))
        .build()?;
    let mut config = builder.try_deserialize::<AppConfig>()?;

    if config.backends.is_empty() {
        config.backends = backends_from_env(|key| env::var(key).ok());
    }

    config.validate()?;
    Ok(config)
}

/// Build the default backend set from `LOCAL_ROOT`, `DROPBOX_ACCESS_TOKEN`
/// and the `FTPS_*` variables. A backend is only added when its required
/// variables are present.
pub fn backends_from_env<F>(lookup: F) -> Vec<BackendConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut backends = vec![BackendConfig::Local {
        id: "local".to_string(),
        root: lookup("LOCAL_ROOT").unwrap_or_else(|| ".".to_string()),
    }];

    if let Some(token) = lookup("DROPBOX_ACCESS_TOKEN").filter(|t| !t.is_empty()) {
        backends.push(BackendConfig::Cloud {
            id: "dropbox".to_string(),
            access_token: Secret::new(token),
        });
    }

    if let Some(host) = lookup("FTPS_HOST").filter(|h| !h.is_empty()) {
        let port = lookup("FTPS_PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_FTPS_PORT);
        backends.push(BackendConfig::Ftps {
            id: "ftps".to_string(),
            host,
            port,
            user: lookup("FTPS_USER").unwrap_or_default(),
            password: Secret::new(lookup("FTPS_PASSWORD").unwrap_or_default()),
        });
    }

    backends
}
