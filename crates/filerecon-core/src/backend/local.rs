use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rayon::prelude::*;
use std::fs::{self, File, Metadata};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{error, trace};

use super::{BackendKind, RawEntry, StorageBackend};
use crate::error::BackendError;

/// Files under `<root>/<base_folder>` on the local filesystem.
pub struct LocalBackend {
    id: String,
    base_dir: PathBuf,
}

impl LocalBackend {
    pub fn new(id: &str, root: &str, base_folder: &str) -> Self {
        Self {
            id: id.to_string(),
            base_dir: Path::new(root).join(base_folder.trim_matches('/')),
        }
    }

    fn unavailable(&self, err: impl ToString) -> BackendError {
        BackendError::unavailable(&self.id, err)
    }
}

impl StorageBackend for LocalBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn connect(&mut self) -> Result<(), BackendError> {
        if self.base_dir.is_dir() {
            Ok(())
        } else {
            Err(BackendError::connection(
                &self.id,
                format!("{} is not a directory", self.base_dir.display()),
            ))
        }
    }

    fn list(&mut self) -> Result<Vec<RawEntry>, BackendError> {
        let found: DashMap<String, RawEntry> = DashMap::new();
        visit_dirs(&self.base_dir, &self.base_dir, &found).map_err(|e| self.unavailable(e))?;

        let mut entries: Vec<RawEntry> = found.into_iter().map(|(_, entry)| entry).collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn fetch(&mut self, entry: &RawEntry) -> Result<Box<dyn Read>, BackendError> {
        let path = self.base_dir.join(&entry.path);
        match File::open(&path) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(BackendError::not_found(&self.id, &entry.path))
            }
            Err(e) => Err(self.unavailable(format!("{}: {}", path.display(), e))),
        }
    }
}

fn visit_dirs(base: &Path, dir: &Path, found: &DashMap<String, RawEntry>) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            if err.kind() == io::ErrorKind::PermissionDenied {
                error!("Access denied reading directory {}: {}", dir.display(), err);
                return Ok(());
            } else if err.kind() == io::ErrorKind::NotFound && dir != base {
                trace!("Directory {} vanished during listing", dir.display());
                return Ok(());
            } else {
                return Err(io::Error::new(
                    err.kind(),
                    format!("Error reading directory {}: {}", dir.display(), err),
                ));
            }
        }
    };

    entries.par_bridge().try_for_each(|entry_result| {
        let entry = entry_result.map_err(|err| {
            io::Error::new(
                err.kind(),
                format!("Error reading entry in directory {}: {}", dir.display(), err),
            )
        })?;

        let path = entry.path();
        let Some(metadata) = entry_metadata(&path)? else {
            return Ok(());
        };

        if metadata.file_type().is_symlink() {
            trace!("Skipping symlink {}", path.display());
        } else if metadata.is_dir() {
            visit_dirs(base, &path, found)?;
        } else if let Some(relative) = relative_path(base, &path) {
            let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
            found.insert(
                relative.clone(),
                RawEntry {
                    path: relative,
                    size: metadata.len(),
                    modified,
                    content_hash: None,
                },
            );
        }
        Ok(())
    })
}

/// Metadata of a listed entry, or `None` if it was removed since `read_dir`.
fn entry_metadata(path: &Path) -> io::Result<Option<Metadata>> {
    match fs::symlink_metadata(path) {
        Ok(metadata) => Ok(Some(metadata)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            trace!("{} vanished during listing", path.display());
            Ok(None)
        }
        Err(err) => Err(io::Error::new(
            err.kind(),
            format!("Error getting metadata for {}: {}", path.display(), err),
        )),
    }
}

fn relative_path(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
