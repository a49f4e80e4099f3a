use ahash::AHashSet;
use std::io::Read;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use suppaftp::native_tls::TlsConnector;
use suppaftp::{FtpError, NativeTlsConnector, NativeTlsFtpStream, Status};
use tracing::{debug, trace, warn};

use super::{relative_to_base, BackendKind, RawEntry, StorageBackend};
use crate::config::Secret;
use crate::error::BackendError;

const MAX_DEPTH: usize = 32;

/// A folder on an FTP server reached over explicit TLS.
pub struct FtpsBackend {
    id: String,
    host: String,
    port: u16,
    user: String,
    password: Secret,
    base_folder: String,
    timeout: Duration,
    stream: Option<NativeTlsFtpStream>,
}

impl FtpsBackend {
    pub fn new(
        id: &str,
        host: &str,
        port: u16,
        user: &str,
        password: Secret,
        base_folder: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            id: id.to_string(),
            host: host.to_string(),
            port,
            user: user.to_string(),
            password,
            base_folder: base_folder.trim_matches('/').to_string(),
            timeout,
            stream: None,
        }
    }

    fn resolve(&self) -> Result<SocketAddr, BackendError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| BackendError::connection(&self.id, e))?
            .next()
            .ok_or_else(|| {
                BackendError::connection(&self.id, format!("cannot resolve {}", self.host))
            })
    }

    fn stream(&mut self) -> Result<&mut NativeTlsFtpStream, BackendError> {
        let id = &self.id;
        self.stream
            .as_mut()
            .ok_or_else(|| BackendError::unavailable(id, "not connected"))
    }

    fn remote_path(&self, relative: &str) -> String {
        if self.base_folder.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{}", self.base_folder, relative)
        }
    }
}

impl StorageBackend for FtpsBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Ftps
    }

    fn connect(&mut self) -> Result<(), BackendError> {
        let addr = self.resolve()?;
        let plain = NativeTlsFtpStream::connect_timeout(addr, self.timeout)
            .map_err(|e| BackendError::connection(&self.id, e))?;
        plain
            .get_ref()
            .set_read_timeout(Some(self.timeout))
            .map_err(|e| BackendError::connection(&self.id, e))?;

        let connector = TlsConnector::new().map_err(|e| BackendError::connection(&self.id, e))?;
        let mut stream = plain
            .into_secure(NativeTlsConnector::from(connector), &self.host)
            .map_err(|e| BackendError::connection(&self.id, e))?;
        stream
            .login(self.user.as_str(), self.password.expose())
            .map_err(|e| BackendError::connection(&self.id, e))?;

        debug!("Connected to ftps://{}:{} as {}", self.host, self.port, self.user);
        self.stream = Some(stream);
        Ok(())
    }

    /// Walks the base folder with NLST. Names that refuse SIZE are taken for
    /// directories and listed in turn, down to `MAX_DEPTH` levels.
    fn list(&mut self) -> Result<Vec<RawEntry>, BackendError> {
        let base = self.base_folder.clone();
        let id = self.id.clone();
        let stream = self.stream()?;

        let mut entries = Vec::new();
        let mut visited = AHashSet::new();
        let mut pending = vec![(base.clone(), 0usize)];

        while let Some((dir, depth)) = pending.pop() {
            if !visited.insert(dir.clone()) {
                continue;
            }
            let names = match stream.nlst(Some(dir.as_str())) {
                Ok(names) => names,
                Err(e) if dir == base => return Err(BackendError::unavailable(&id, e)),
                Err(e) => {
                    trace!("Cannot list {} on {}: {}", dir, id, e);
                    continue;
                }
            };

            for name in names {
                if is_dot_entry(&name) {
                    continue;
                }
                let full = child_path(&dir, &name);
                let Some(relative) = relative_to_base(&full, &base).map(str::to_string) else {
                    trace!("Ignoring {} outside {}", full, base);
                    continue;
                };

                let size = match stream.size(full.as_str()) {
                    Ok(size) => size as u64,
                    Err(_) if depth + 1 < MAX_DEPTH => {
                        pending.push((full, depth + 1));
                        continue;
                    }
                    Err(e) => {
                        warn!("Not descending into {} on {}: {}", full, id, e);
                        continue;
                    }
                };
                let modified = match stream.mdtm(full.as_str()) {
                    Ok(naive) => Some(naive.and_utc()),
                    Err(e) => {
                        warn!("MDTM failed for {} on {}: {}", full, id, e);
                        None
                    }
                };

                entries.push(RawEntry {
                    path: relative,
                    size,
                    modified,
                    content_hash: None,
                });
            }
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries.dedup_by(|a, b| a.path == b.path);
        Ok(entries)
    }

    fn fetch(&mut self, entry: &RawEntry) -> Result<Box<dyn Read>, BackendError> {
        let remote = self.remote_path(&entry.path);
        let id = self.id.clone();
        let stream = self.stream()?;
        match stream.retr_as_buffer(remote.as_str()) {
            Ok(buffer) => Ok(Box::new(buffer)),
            Err(FtpError::UnexpectedResponse(response))
                if response.status == Status::FileUnavailable =>
            {
                Err(BackendError::not_found(&id, &entry.path))
            }
            Err(e) => Err(BackendError::unavailable(&id, e)),
        }
    }

    fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.quit() {
                debug!("QUIT failed on {}: {}", self.id, e);
            }
        }
    }
}

/// Some servers answer NLST with bare names, others with full paths.
fn child_path(dir: &str, name: &str) -> String {
    if name.contains('/') || dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

fn is_dot_entry(name: &str) -> bool {
    matches!(name.rsplit('/').next(), Some(".") | Some(".."))
}

impl Drop for FtpsBackend {
    fn drop(&mut self) {
        self.close();
    }
}
