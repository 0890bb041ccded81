use regex::Regex;
use serde::de::DeserializeOwned;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::{fs, io};
use thiserror::Error;
use tracing::debug;

pub const CONFIG_DIR: &str = "config";
pub const COMMON_FILE_NAME: &str = "common.yaml";
pub const DEFAULT_ENVIRONMENT: &str = "dev";

static ENVIRONMENT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").expect("environment name pattern"));

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing configuration file: {}", path.display())]
    MissingFile { path: PathBuf },
    #[error("key not found: '{key}' (environment: {environment})")]
    KeyNotFound { key: String, environment: String },
    #[error("reading config file {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse {}: {source}", path.display())]
    Parse { path: PathBuf, source: serde_yaml::Error },
    #[error("config file {} must contain a mapping at the top level", path.display())]
    NotAMapping { path: PathBuf },
    #[error("config file {} has a non-scalar top-level key", path.display())]
    InvalidKey { path: PathBuf },
    #[error("config file {} defines key '{key}' more than once", path.display())]
    DuplicateKey { path: PathBuf, key: String },
    #[error("invalid environment name: '{name}'")]
    InvalidEnvironment { name: String },
    #[error("invalid value for key '{key}': {source}")]
    InvalidValue { key: String, source: serde_yaml::Error },
}

/// A settings document and the policy for when it is absent.
///
/// The baseline is optional and reads as an empty mapping when missing; the
/// environment document is required and a missing file is an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Document {
    Optional(PathBuf),
    Required(PathBuf),
}

impl Document {
    pub fn path(&self) -> &Path {
        match self {
            Document::Optional(p) | Document::Required(p) => p,
        }
    }

    pub fn load(&self) -> Result<BTreeMap<String, Value>, ConfigError> {
        let path = self.path();
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return match self {
                    Document::Optional(_) => {
                        debug!(path = %path.display(), "optional settings document absent");
                        Ok(BTreeMap::new())
                    }
                    Document::Required(_) => Err(ConfigError::MissingFile { path: path.to_path_buf() }),
                };
            }
            Err(source) => return Err(ConfigError::Read { path: path.to_path_buf(), source }),
        };
        parse_mapping(path, &text)
    }
}

fn parse_mapping(path: &Path, text: &str) -> Result<BTreeMap<String, Value>, ConfigError> {
    if text.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let doc: Value = serde_yaml::from_str(text)
        .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
    let mapping = match doc {
        Value::Null => return Ok(BTreeMap::new()),
        Value::Mapping(m) => m,
        _ => return Err(ConfigError::NotAMapping { path: path.to_path_buf() }),
    };
    let mut out = BTreeMap::new();
    for (k, v) in mapping {
        let key = match k {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => return Err(ConfigError::InvalidKey { path: path.to_path_buf() }),
        };
        if out.contains_key(&key) {
            return Err(ConfigError::DuplicateKey { path: path.to_path_buf(), key });
        }
        out.insert(key, v);
    }
    Ok(out)
}

/// Merged settings for one deployment environment.
#[derive(Debug, Clone)]
pub struct Settings {
    environment: String,
    config_dir: PathBuf,
    data: BTreeMap<String, Value>,
}

impl Settings {
    /// Loads `common.yaml` and `{environment}.yaml` from `config_dir`; an empty
    /// or absent environment name falls back to [`DEFAULT_ENVIRONMENT`].
    pub fn load(config_dir: impl AsRef<Path>, environment: Option<&str>) -> Result<Self, ConfigError> {
        let environment = resolve_environment(environment)?;
        let config_dir = config_dir.as_ref().to_path_buf();

        let baseline = Document::Optional(config_dir.join(COMMON_FILE_NAME));
        let overlay = Document::Required(config_dir.join(format!("{}.yaml", environment)));

        let mut data = baseline.load()?;
        let overrides = overlay.load()?;
        debug!(
            environment = %environment,
            baseline_keys = data.len(),
            environment_keys = overrides.len(),
            "merging settings documents"
        );
        // top-level replace only
        data.extend(overrides);

        Ok(Self { environment, config_dir, data })
    }

    pub fn get(&self, key: &str) -> Result<&Value, ConfigError> {
        self.data.get(key).ok_or_else(|| ConfigError::KeyNotFound {
            key: key.to_string(),
            environment: self.environment.clone(),
        })
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError> {
        let value = self.get(key)?.clone();
        serde_yaml::from_value(value).map_err(|source| ConfigError::InvalidValue { key: key.to_string(), source })
    }

    pub fn environment(&self) -> &str { &self.environment }

    pub fn config_dir(&self) -> &Path { &self.config_dir }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> { self.data.iter() }

    pub fn len(&self) -> usize { self.data.len() }

    pub fn is_empty(&self) -> bool { self.data.is_empty() }
}

fn resolve_environment(environment: Option<&str>) -> Result<String, ConfigError> {
    let name = match environment.map(str::trim) {
        Some(name) if !name.is_empty() => name,
        _ => DEFAULT_ENVIRONMENT,
    };
    if !ENVIRONMENT_NAME.is_match(name) {
        return Err(ConfigError::InvalidEnvironment { name: name.to_string() });
    }
    Ok(name.to_string())
}
