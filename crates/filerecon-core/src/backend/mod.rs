pub mod cloud;
pub mod ftps;
pub mod local;

use chrono::{DateTime, Utc};
use glob::Pattern;
use serde::Serialize;
use std::fmt;
use std::io::Read;
use std::time::Duration;
use tracing::error;

use crate::config::BackendConfig;
use crate::error::BackendError;

pub use cloud::CloudBackend;
pub use ftps::FtpsBackend;
pub use local::LocalBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Ftps,
    Cloud,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Local => "local",
            BackendKind::Ftps => "ftps",
            BackendKind::Cloud => "cloud",
        };
        f.write_str(name)
    }
}

/// One file as reported by a backend listing, before fingerprinting.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEntry {
    /// Path relative to the base folder, `/`-separated.
    pub path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    /// Content fingerprint supplied by the backend itself, if any.
    pub content_hash: Option<String>,
}

/// Uniform capability set of a storage backend.
///
/// The engine only talks to backends through this trait; nothing downstream
/// of construction looks at the concrete type.
pub trait StorageBackend: Send {
    fn id(&self) -> &str;

    fn kind(&self) -> BackendKind;

    fn connect(&mut self) -> Result<(), BackendError>;

    /// List every file under the configured base folder.
    fn list(&mut self) -> Result<Vec<RawEntry>, BackendError>;

    /// Open the content of a previously listed entry.
    fn fetch(&mut self, entry: &RawEntry) -> Result<Box<dyn Read>, BackendError>;

    fn close(&mut self) {}
}

/// A backend that dropped out of a run, or lost entries during it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendFailure {
    pub backend: String,
    pub reason: String,
}

impl BackendFailure {
    pub fn new(backend: &str, error: &BackendError) -> Self {
        Self {
            backend: backend.to_string(),
            reason: error.to_string(),
        }
    }
}

impl fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.backend, self.reason)
    }
}

/// Build a fresh, unconnected backend from its configuration.
pub fn build_backend(
    config: &BackendConfig,
    base_folder: &str,
    timeout: Duration,
) -> Box<dyn StorageBackend> {
    match config {
        BackendConfig::Local { id, root } => Box::new(LocalBackend::new(id, root, base_folder)),
        BackendConfig::Ftps {
            id,
            host,
            port,
            user,
            password,
        } => Box::new(FtpsBackend::new(
            id,
            host,
            *port,
            user,
            password.clone(),
            base_folder,
            timeout,
        )),
        BackendConfig::Cloud { id, access_token } => Box::new(CloudBackend::new(
            id,
            access_token.clone(),
            base_folder,
            timeout,
        )),
    }
}

/// Strip the base folder from a backend path, returning the remainder.
///
/// Leading slashes are ignored and the folder name is matched without regard
/// to ASCII case, since Dropbox reports lowercased paths. Anything outside the
/// base folder yields `None`.
pub fn relative_to_base<'a>(path: &'a str, base_folder: &str) -> Option<&'a str> {
    let path = path.trim_start_matches('/');
    let base = base_folder.trim_matches('/');
    if base.is_empty() {
        return Some(path).filter(|p| !p.is_empty());
    }
    if path.len() <= base.len() + 1 || !path.is_char_boundary(base.len()) {
        return None;
    }
    let (head, tail) = path.split_at(base.len());
    if !head.eq_ignore_ascii_case(base) {
        return None;
    }
    tail.strip_prefix('/').filter(|rest| !rest.is_empty())
}

/// Glob filter applied to every backend's relative paths.
#[derive(Debug, Clone, Default)]
pub struct IgnoreSet {
    patterns: Vec<Pattern>,
}

impl IgnoreSet {
    pub fn new(globs: &[String]) -> Self {
        let patterns = globs
            .iter()
            .filter_map(|glob| match Pattern::new(glob) {
                Ok(p) => Some(p),
                Err(e) => {
                    error!("Invalid glob pattern '{}': {}", glob, e);
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    pub fn is_ignored(&self, relative_path: &str) -> bool {
        let name = relative_path.rsplit('/').next().unwrap_or(relative_path);
        self.patterns
            .iter()
            .any(|pattern| pattern.matches(relative_path) || pattern.matches(name))
    }
}
