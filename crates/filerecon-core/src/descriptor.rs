use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read};

use crate::backend::{RawEntry, StorageBackend};
use crate::error::BackendError;

/// Dropbox hashes content in 4 MiB blocks.
pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Leading bytes of a text file kept for content classification.
pub const TEXT_SAMPLE_LIMIT: usize = 64 * 1024;

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "text", "md", "csv", "tsv", "log", "json", "xml", "html", "htm", "yaml", "yml", "toml",
    "ini", "cfg", "conf", "rtf", "sql",
];

/// Content-addressed identifier of a file's bytes.
///
/// SHA-256 over the concatenated SHA-256 digests of each 4 MiB block,
/// hex-encoded. This is the Dropbox `content_hash` scheme, so the value
/// Dropbox reports in its listings is directly comparable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Accept a fingerprint computed elsewhere (e.g. a backend listing hint).
    pub fn from_hex(hex: &str) -> Self {
        Fingerprint(hex.trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalized record for one file instance on one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileDescriptor {
    pub backend_id: String,
    pub path: String,
    pub name: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub fingerprint: Fingerprint,
    /// Leading text of a text file whose bytes were read during extraction.
    #[serde(skip)]
    pub text_sample: Option<String>,
}

impl FileDescriptor {
    /// Build a descriptor from a listing entry and its fingerprint.
    pub fn from_entry(backend_id: &str, entry: &RawEntry, fingerprint: Fingerprint) -> Self {
        let name = entry
            .path
            .rsplit('/')
            .next()
            .unwrap_or(entry.path.as_str())
            .to_string();
        Self {
            backend_id: backend_id.to_string(),
            path: entry.path.clone(),
            name,
            size: entry.size,
            last_modified: entry.modified,
            fingerprint,
            text_sample: None,
        }
    }
}

/// Whether the file name carries one of the plain-text extensions.
pub fn is_text_file(name: &str) -> bool {
    name.rsplit_once('.')
        .map(|(_, ext)| {
            let ext = ext.to_ascii_lowercase();
            TEXT_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Turn a listing entry into a descriptor, downloading the content only when
/// the backend did not already supply a fingerprint. Text files that are
/// downloaded keep a leading sample for content classification.
pub fn extract(
    backend: &mut dyn StorageBackend,
    entry: &RawEntry,
) -> Result<FileDescriptor, BackendError> {
    let (fingerprint, text_sample) = match &entry.content_hash {
        Some(hint) => (Fingerprint::from_hex(hint), None),
        None => {
            let reader = backend.fetch(entry)?;
            let sample = is_text_file(&entry.path);
            fingerprint_with_sample(reader, sample).map_err(|e| {
                BackendError::unavailable(backend.id(), format!("{}: {}", entry.path, e))
            })?
        }
    };
    let mut descriptor = FileDescriptor::from_entry(backend.id(), entry, fingerprint);
    descriptor.text_sample = text_sample;
    Ok(descriptor)
}

pub fn fingerprint_reader<R: Read>(reader: R) -> io::Result<Fingerprint> {
    fingerprint_with_sample(reader, false).map(|(fingerprint, _)| fingerprint)
}

/// Fingerprint the stream and, when `sample` is set, decode up to
/// `TEXT_SAMPLE_LIMIT` leading bytes as text.
pub fn fingerprint_with_sample<R: Read>(
    mut reader: R,
    sample: bool,
) -> io::Result<(Fingerprint, Option<String>)> {
    let mut outer = Sha256::new();
    let mut block = vec![0u8; BLOCK_SIZE];
    let mut text = None;

    loop {
        let filled = read_block(&mut reader, &mut block)?;
        if sample && text.is_none() {
            let head = &block[..filled.min(TEXT_SAMPLE_LIMIT)];
            text = Some(String::from_utf8_lossy(head).into_owned());
        }
        if filled == 0 {
            break;
        }
        outer.update(Sha256::digest(&block[..filled]));
        if filled < BLOCK_SIZE {
            break;
        }
    }

    Ok((Fingerprint(hex::encode(outer.finalize())), text))
}

pub fn fingerprint_bytes(data: &[u8]) -> Fingerprint {
    let mut outer = Sha256::new();
    for chunk in data.chunks(BLOCK_SIZE) {
        outer.update(Sha256::digest(chunk));
    }
    Fingerprint(hex::encode(outer.finalize()))
}

/// Fill `buffer` completely unless the reader hits EOF first.
fn read_block<R: Read>(reader: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
