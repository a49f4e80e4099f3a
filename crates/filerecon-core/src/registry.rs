use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::backend::BackendFailure;
use crate::descriptor::{FileDescriptor, Fingerprint};
use crate::sensitivity::{Sensitivity, SensitivityClassifier};

lazy_static::lazy_static! {
    static ref GLOBAL_REGISTRY: Arc<FileRegistry> = Arc::new(FileRegistry::new());
}

/// Process-wide registry, empty until the first successful sync.
pub fn global() -> Arc<FileRegistry> {
    Arc::clone(&GLOBAL_REGISTRY)
}

/// A cluster of descriptors judged to be the same underlying file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogicalFile {
    /// Derived from the representative's fingerprint; stable across runs.
    pub id: Uuid,
    pub canonical_name: String,
    pub representative: FileDescriptor,
    /// Backend ids holding a copy, sorted and de-duplicated.
    pub locations: Vec<String>,
    pub members: Vec<FileDescriptor>,
    pub backup_count: usize,
    pub sensitivity: Sensitivity,
}

impl LogicalFile {
    /// `updated_at` is when the run that produced this file completed.
    pub fn summary(&self, updated_at: DateTime<Utc>) -> LogicalFileSummary {
        LogicalFileSummary {
            id: self.id,
            name: self.canonical_name.clone(),
            path: self.representative.path.clone(),
            size: self.representative.size,
            last_modified: self.representative.last_modified,
            fingerprint: self.representative.fingerprint.clone(),
            sensitivity: self.sensitivity,
            backup_count: self.backup_count,
            locations: self.locations.clone(),
            updated_at,
        }
    }
}

/// Flat view of a logical file for listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogicalFileSummary {
    pub id: Uuid,
    pub name: String,
    pub path: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub fingerprint: Fingerprint,
    pub sensitivity: Sensitivity,
    pub backup_count: usize,
    pub locations: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Result of one completed reconciliation run.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub files: Vec<LogicalFile>,
    pub descriptors_processed: usize,
    pub degraded: Vec<BackendFailure>,
    pub completed_at: DateTime<Utc>,
}

/// Holds the latest snapshot. Publication swaps the whole snapshot, so a
/// reader sees either the previous run or the new one, never a mix.
#[derive(Debug, Default)]
pub struct FileRegistry {
    current: RwLock<Option<Arc<RegistrySnapshot>>>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: RegistrySnapshot) {
        let snapshot = Arc::new(snapshot);
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = Some(snapshot);
    }

    pub fn snapshot(&self) -> Option<Arc<RegistrySnapshot>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn list_files(&self) -> Vec<LogicalFileSummary> {
        self.snapshot()
            .map(|s| s.files.iter().map(|f| f.summary(s.completed_at)).collect())
            .unwrap_or_default()
    }
}

/// Turn index groups into logical files.
///
/// The representative is the member with the smallest `(backend_id, path)`;
/// files are ordered by canonical name, then representative backend and path.
/// Sensitivity looks at the canonical name and the first text sample held by
/// any member.
pub fn materialize(
    descriptors: &[FileDescriptor],
    groups: &[Vec<usize>],
    sensitivity: &dyn SensitivityClassifier,
) -> Vec<LogicalFile> {
    let mut files: Vec<LogicalFile> = groups
        .iter()
        .filter(|group| !group.is_empty())
        .map(|group| {
            let mut members: Vec<FileDescriptor> =
                group.iter().map(|&i| descriptors[i].clone()).collect();
            members.sort_by(|a, b| (&a.backend_id, &a.path).cmp(&(&b.backend_id, &b.path)));

            let representative = members[0].clone();
            let mut locations: Vec<String> =
                members.iter().map(|m| m.backend_id.clone()).collect();
            locations.dedup();
            let sample = members.iter().find_map(|m| m.text_sample.as_deref());
            let sensitivity = sensitivity.classify(&representative.name, sample);

            LogicalFile {
                id: Uuid::new_v5(
                    &Uuid::NAMESPACE_OID,
                    representative.fingerprint.as_str().as_bytes(),
                ),
                canonical_name: representative.name.clone(),
                sensitivity,
                backup_count: members.len().saturating_sub(1),
                representative,
                locations,
                members,
            }
        })
        .collect();

    files.sort_by(|a, b| {
        (&a.canonical_name, &a.representative.backend_id, &a.representative.path).cmp(&(
            &b.canonical_name,
            &b.representative.backend_id,
            &b.representative.path,
        ))
    });
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::fingerprint_bytes;
    use crate::sensitivity::KeywordClassifier;

    fn descriptor(backend: &str, path: &str, content: &[u8]) -> FileDescriptor {
        FileDescriptor {
            backend_id: backend.to_string(),
            path: path.to_string(),
            name: path.rsplit('/').next().unwrap().to_string(),
            size: content.len() as u64,
            last_modified: None,
            fingerprint: fingerprint_bytes(content),
            text_sample: None,
        }
    }

    fn snapshot(files: Vec<LogicalFile>) -> RegistrySnapshot {
        RegistrySnapshot {
            descriptors_processed: files.iter().map(|f| f.members.len()).sum(),
            files,
            degraded: Vec::new(),
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_materialize_picks_smallest_backend_then_path() {
        let descriptors = vec![
            descriptor("local", "z.txt", b"X"),
            descriptor("dropbox", "b/salary.txt", b"X"),
            descriptor("dropbox", "a/salary.txt", b"X"),
        ];
        let sensitivity = KeywordClassifier::new(vec!["salary"], Vec::<String>::new()).unwrap();
        let files = materialize(&descriptors, &[vec![0, 1, 2]], &sensitivity);

        assert_eq!(files.len(), 1);
        let file = &files[0];
        assert_eq!(file.representative.backend_id, "dropbox");
        assert_eq!(file.representative.path, "a/salary.txt");
        assert_eq!(file.canonical_name, "salary.txt");
        assert_eq!(file.locations, vec!["dropbox", "local"]);
        assert_eq!(file.backup_count, 2);
        assert_eq!(file.sensitivity, Sensitivity::Sensitive);
    }

    #[test]
    fn test_sensitivity_reads_member_text_sample() {
        let mut copy = descriptor("local", "minutes.txt", b"M");
        copy.text_sample = Some("board discussed the payroll run".to_string());
        let descriptors = vec![descriptor("dropbox", "minutes.txt", b"M"), copy];
        let sensitivity = KeywordClassifier::builtin().unwrap();
        let files = materialize(&descriptors, &[vec![0, 1]], &sensitivity);

        assert_eq!(files[0].representative.backend_id, "dropbox");
        assert_eq!(files[0].sensitivity, Sensitivity::Sensitive);
    }

    #[test]
    fn test_id_is_stable_for_same_content() {
        let sensitivity = KeywordClassifier::builtin().unwrap();
        let a = materialize(&[descriptor("local", "a.txt", b"X")], &[vec![0]], &sensitivity);
        let b = materialize(&[descriptor("ftps", "b.txt", b"X")], &[vec![0]], &sensitivity);
        assert_eq!(a[0].id, b[0].id);
    }

    #[test]
    fn test_registry_empty_until_published() {
        let registry = FileRegistry::new();
        assert!(registry.list_files().is_empty());
        assert!(registry.snapshot().is_none());

        let sensitivity = KeywordClassifier::builtin().unwrap();
        let files = materialize(&[descriptor("local", "a.txt", b"X")], &[vec![0]], &sensitivity);
        registry.publish(snapshot(files));

        let listed = registry.list_files();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].updated_at, registry.snapshot().unwrap().completed_at);
        assert_eq!(listed[0].name, "a.txt");
        assert_eq!(listed[0].backup_count, 0);
        assert_eq!(registry.snapshot().unwrap().descriptors_processed, 1);
    }

    #[test]
    fn test_publish_replaces_wholesale() {
        let registry = FileRegistry::new();
        let sensitivity = KeywordClassifier::builtin().unwrap();
        let descriptors = vec![descriptor("local", "a.txt", b"X"), descriptor("local", "b.txt", b"Y")];
        registry.publish(snapshot(materialize(&descriptors, &[vec![0], vec![1]], &sensitivity)));
        let first = registry.snapshot().unwrap();

        registry.publish(snapshot(materialize(&descriptors[..1], &[vec![0]], &sensitivity)));
        assert_eq!(registry.list_files().len(), 1);
        // Readers holding the old snapshot keep a consistent view.
        assert_eq!(first.files.len(), 2);
    }
}
