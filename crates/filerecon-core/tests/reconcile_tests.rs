use std::collections::HashSet;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use sha2::{Digest, Sha256};

use filerecon_core::classifier::Prediction;
use filerecon_core::compare::FeatureVector;
use filerecon_core::{
    BackendError, BackendKind, BackendProvider, ClassifierError, Error, IdentityClassifier,
    KeywordClassifier, Label, LogisticModel, RawEntry, Sensitivity, SilentReporter,
    StorageBackend, SyncEngine, SyncPhase,
};

/// In-memory backend with knobs for the failure modes a real adapter hits.
#[derive(Clone, Default)]
struct MemoryBackend {
    id: String,
    files: Vec<(String, Vec<u8>)>,
    refuse_connect: bool,
    connect_delay: Duration,
    fail_list: bool,
    vanished: Vec<String>,
    fetch_delay: Duration,
    fetches: Arc<AtomicUsize>,
    /// List a precomputed upper-case content hash, as a remote API would.
    hinted: bool,
}

impl MemoryBackend {
    fn new(id: &str, files: &[(&str, &[u8])]) -> Self {
        Self {
            id: id.to_string(),
            files: files
                .iter()
                .map(|(path, content)| (path.to_string(), content.to_vec()))
                .collect(),
            ..Default::default()
        }
    }

    fn refusing(id: &str) -> Self {
        Self {
            id: id.to_string(),
            refuse_connect: true,
            ..Default::default()
        }
    }
}

impl StorageBackend for MemoryBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn connect(&mut self) -> Result<(), BackendError> {
        thread::sleep(self.connect_delay);
        if self.refuse_connect {
            return Err(BackendError::connection(&self.id, "connection refused"));
        }
        Ok(())
    }

    fn list(&mut self) -> Result<Vec<RawEntry>, BackendError> {
        if self.fail_list {
            return Err(BackendError::unavailable(&self.id, "listing failed"));
        }
        Ok(self
            .files
            .iter()
            .map(|(path, content)| RawEntry {
                path: path.clone(),
                size: content.len() as u64,
                modified: None,
                content_hash: self.hinted.then(|| content_hash(content)),
            })
            .collect())
    }

    fn fetch(&mut self, entry: &RawEntry) -> Result<Box<dyn Read>, BackendError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.fetch_delay);
        if self.hinted {
            return Err(BackendError::unavailable(&self.id, "downloads disabled"));
        }
        if self.vanished.contains(&entry.path) {
            return Err(BackendError::not_found(&self.id, &entry.path));
        }
        self.files
            .iter()
            .find(|(path, _)| *path == entry.path)
            .map(|(_, content)| Box::new(Cursor::new(content.clone())) as Box<dyn Read>)
            .ok_or_else(|| BackendError::not_found(&self.id, &entry.path))
    }
}

/// Block-wise sha256 of sha256 digests, upper-cased.
fn content_hash(content: &[u8]) -> String {
    let mut outer = Sha256::new();
    for block in content.chunks(4 * 1024 * 1024) {
        outer.update(Sha256::digest(block));
    }
    hex::encode_upper(outer.finalize())
}

/// Provider whose backend set can be swapped between runs.
#[derive(Clone, Default)]
struct SharedProvider(Arc<Mutex<Vec<MemoryBackend>>>);

impl SharedProvider {
    fn new(backends: Vec<MemoryBackend>) -> Self {
        Self(Arc::new(Mutex::new(backends)))
    }

    fn replace(&self, backends: Vec<MemoryBackend>) {
        *self.0.lock().unwrap() = backends;
    }
}

impl BackendProvider for SharedProvider {
    fn backends(&self) -> Vec<Box<dyn StorageBackend>> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .map(|b| Box::new(b) as Box<dyn StorageBackend>)
            .collect()
    }
}

struct AlwaysDifferent;

impl IdentityClassifier for AlwaysDifferent {
    fn predict(&self, _features: &FeatureVector) -> Result<Prediction, ClassifierError> {
        Ok(Prediction {
            label: Label::Different,
            confidence: 1.0,
        })
    }
}

struct AlwaysSame;

impl IdentityClassifier for AlwaysSame {
    fn predict(&self, _features: &FeatureVector) -> Result<Prediction, ClassifierError> {
        Ok(Prediction {
            label: Label::Same,
            confidence: 1.0,
        })
    }
}

struct Broken;

impl IdentityClassifier for Broken {
    fn predict(&self, _features: &FeatureVector) -> Result<Prediction, ClassifierError> {
        Err(ClassifierError::InvalidInput("model offline".to_string()))
    }
}

fn engine_with(provider: SharedProvider, classifier: Arc<dyn IdentityClassifier>) -> SyncEngine {
    SyncEngine::new(
        provider,
        classifier,
        Arc::new(KeywordClassifier::builtin().unwrap()),
    )
    .with_timeout(Duration::from_secs(5))
}

fn engine(provider: SharedProvider) -> SyncEngine {
    engine_with(provider, Arc::new(LogisticModel::builtin()))
}

fn three_backends() -> Vec<MemoryBackend> {
    vec![
        MemoryBackend::new("local", &[("a.txt", b"X")]),
        MemoryBackend::new("ftps", &[("a_copy.txt", b"X")]),
        MemoryBackend::new("dropbox", &[("b.txt", b"Y")]),
    ]
}

#[test]
fn test_exact_copies_across_backends_merge() {
    let engine = engine(SharedProvider::new(three_backends()));

    let count = engine.trigger_sync().unwrap();
    assert_eq!(count, 3);

    let files = engine.list_files();
    assert_eq!(files.len(), 2);

    let a = files.iter().find(|f| f.backup_count == 1).unwrap();
    assert_eq!(a.locations, vec!["ftps", "local"]);
    // ftps < local, so the ftps copy represents the group
    assert_eq!(a.name, "a_copy.txt");

    let b = files.iter().find(|f| f.name == "b.txt").unwrap();
    assert_eq!(b.backup_count, 0);
    assert_eq!(b.locations, vec!["dropbox"]);
    assert_eq!(engine.phase(), SyncPhase::Published);
}

#[test]
fn test_every_descriptor_lands_in_exactly_one_file() {
    let backends = vec![
        MemoryBackend::new(
            "local",
            &[("a.txt", b"1"), ("dir/a.txt", b"1"), ("c.txt", b"3")],
        ),
        MemoryBackend::new("ftps", &[("a.txt", b"1"), ("d.txt", b"4")]),
        MemoryBackend::new("dropbox", &[("c.txt", b"3"), ("e.txt", b"5")]),
    ];
    let engine = engine(SharedProvider::new(backends));
    let count = engine.trigger_sync().unwrap();
    assert_eq!(count, 7);

    let snapshot = engine.registry().snapshot().unwrap();
    let mut seen = HashSet::new();
    for file in &snapshot.files {
        assert!(!file.members.is_empty());
        assert_eq!(file.backup_count, file.members.len() - 1);
        for member in &file.members {
            assert!(seen.insert((member.backend_id.clone(), member.path.clone())));
        }
    }
    assert_eq!(seen.len(), count);

    // Same-backend exact copies collapse too.
    let a = snapshot.files.iter().find(|f| f.canonical_name == "a.txt").unwrap();
    assert_eq!(a.members.len(), 3);
}

#[test]
fn test_repeated_sync_is_idempotent() {
    let engine = engine(SharedProvider::new(three_backends()));
    let view = |engine: &SyncEngine| {
        engine
            .list_files()
            .into_iter()
            .map(|f| (f.id, f.name, f.path, f.locations, f.backup_count, f.sensitivity))
            .collect::<Vec<_>>()
    };
    engine.trigger_sync().unwrap();
    let first = view(&engine);
    let first_updated = engine.list_files()[0].updated_at;
    engine.trigger_sync().unwrap();
    assert_eq!(view(&engine), first);
    assert!(engine.list_files()[0].updated_at >= first_updated);
}

#[test]
fn test_unreachable_backend_degrades_run() {
    let provider = SharedProvider::new(vec![
        MemoryBackend::new("local", &[("a.txt", b"X")]),
        MemoryBackend::refusing("ftps"),
        MemoryBackend::new("dropbox", &[("b.txt", b"Y")]),
    ]);
    let engine = engine(provider);

    let report = engine.sync(&SilentReporter).unwrap();
    assert_eq!(report.descriptors_processed, 2);
    assert_eq!(report.logical_files, 2);
    assert_eq!(report.degraded.len(), 1);
    assert_eq!(report.degraded[0].backend, "ftps");

    let snapshot = engine.registry().snapshot().unwrap();
    assert_eq!(snapshot.degraded, report.degraded);
}

#[test]
fn test_listing_failure_degrades_run() {
    let mut broken = MemoryBackend::new("ftps", &[("a.txt", b"X")]);
    broken.fail_list = true;
    let provider = SharedProvider::new(vec![MemoryBackend::new("local", &[("a.txt", b"X")]), broken]);
    let engine = engine(provider);

    let report = engine.sync(&SilentReporter).unwrap();
    assert_eq!(report.descriptors_processed, 1);
    assert_eq!(report.degraded[0].backend, "ftps");
}

#[test]
fn test_total_failure_keeps_previous_registry() {
    let provider = SharedProvider::new(three_backends());
    let engine = engine(provider.clone());
    engine.trigger_sync().unwrap();
    let before = engine.list_files();

    provider.replace(vec![
        MemoryBackend::refusing("local"),
        MemoryBackend::refusing("ftps"),
    ]);
    match engine.trigger_sync() {
        Err(Error::NoBackendsAvailable { failures }) => assert_eq!(failures.len(), 2),
        other => panic!("expected NoBackendsAvailable, got {:?}", other),
    }
    assert_eq!(engine.phase(), SyncPhase::Failed);
    assert_eq!(engine.list_files(), before);
}

#[test]
fn test_no_backends_configured_fails() {
    let engine = engine(SharedProvider::default());
    assert!(matches!(
        engine.trigger_sync(),
        Err(Error::NoBackendsAvailable { .. })
    ));
    assert!(engine.list_files().is_empty());
}

#[test]
fn test_exact_match_overrides_classifier() {
    let provider = SharedProvider::new(vec![
        MemoryBackend::new("local", &[("report.pdf", b"same bytes")]),
        MemoryBackend::new("ftps", &[("totally-different-name.bin", b"same bytes")]),
    ]);
    let engine = engine_with(provider, Arc::new(AlwaysDifferent));
    engine.trigger_sync().unwrap();

    let files = engine.list_files();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].backup_count, 1);
}

#[test]
fn test_always_different_keeps_every_descriptor_apart() {
    let provider = SharedProvider::new(vec![
        MemoryBackend::new("local", &[("a.txt", b"1"), ("b.txt", b"2")]),
        MemoryBackend::new("ftps", &[("a.txt", b"3")]),
        MemoryBackend::new("dropbox", &[("a.txt", b"4")]),
    ]);
    let engine = engine_with(provider, Arc::new(AlwaysDifferent));
    let report = engine.sync(&SilentReporter).unwrap();

    assert_eq!(report.comparisons, 5);
    assert_eq!(report.logical_files, report.descriptors_processed);
    assert!(engine.list_files().iter().all(|f| f.backup_count == 0));
}

#[test]
fn test_classifier_merges_are_transitive() {
    let provider = SharedProvider::new(vec![
        MemoryBackend::new("local", &[("a.txt", b"1")]),
        MemoryBackend::new("ftps", &[("b.txt", b"2")]),
        MemoryBackend::new("dropbox", &[("c.txt", b"3")]),
    ]);
    let engine = engine_with(provider, Arc::new(AlwaysSame));
    let report = engine.sync(&SilentReporter).unwrap();

    assert_eq!(report.comparisons, 3);
    assert_eq!(report.logical_files, 1);
    assert_eq!(engine.list_files()[0].backup_count, 2);
}

#[test]
fn test_classifier_failure_falls_back_to_different() {
    let provider = SharedProvider::new(vec![
        MemoryBackend::new("local", &[("a.txt", b"1")]),
        MemoryBackend::new("ftps", &[("a.txt", b"2")]),
    ]);
    let engine = engine_with(provider, Arc::new(Broken));
    let report = engine.sync(&SilentReporter).unwrap();

    assert_eq!(report.classifier_fallbacks, 1);
    assert_eq!(report.logical_files, 2);
}

#[test]
fn test_hung_backend_times_out() {
    let mut hung = MemoryBackend::new("ftps", &[("a.txt", b"X")]);
    hung.connect_delay = Duration::from_secs(10);
    let provider = SharedProvider::new(vec![MemoryBackend::new("local", &[("a.txt", b"X")]), hung]);
    let engine = engine(provider).with_timeout(Duration::from_millis(300));

    let report = engine.sync(&SilentReporter).unwrap();
    assert!(report.duration < Duration::from_secs(5));
    assert_eq!(report.descriptors_processed, 1);
    assert_eq!(report.degraded[0].backend, "ftps");
    assert!(report.degraded[0].reason.contains("timed out"));
}

#[test]
fn test_concurrent_sync_is_rejected() {
    let mut slow = MemoryBackend::new("local", &[("a.txt", b"X")]);
    slow.connect_delay = Duration::from_millis(800);
    let engine = Arc::new(engine(SharedProvider::new(vec![slow])));

    let running = Arc::clone(&engine);
    let handle = thread::spawn(move || running.trigger_sync());
    thread::sleep(Duration::from_millis(200));

    assert!(matches!(engine.trigger_sync(), Err(Error::SyncInProgress)));
    assert_eq!(handle.join().unwrap().unwrap(), 1);
    // The lock is released once the first run finishes.
    assert_eq!(engine.trigger_sync().unwrap(), 1);
}

#[test]
fn test_vanished_file_is_dropped_silently() {
    let mut racy = MemoryBackend::new("local", &[("a.txt", b"X"), ("gone.txt", b"Z")]);
    racy.vanished = vec!["gone.txt".to_string()];
    let engine = engine(SharedProvider::new(vec![racy]));

    let report = engine.sync(&SilentReporter).unwrap();
    assert_eq!(report.descriptors_processed, 1);
    assert!(report.degraded.is_empty());
    assert_eq!(engine.list_files()[0].name, "a.txt");
}

#[test]
fn test_empty_files_are_reconciled() {
    let provider = SharedProvider::new(vec![
        MemoryBackend::new("local", &[("empty.txt", b"")]),
        MemoryBackend::new("ftps", &[("placeholder", b"")]),
    ]);
    let engine = engine(provider);
    assert_eq!(engine.trigger_sync().unwrap(), 2);
    assert_eq!(engine.list_files().len(), 1);
}

#[test]
fn test_sensitivity_is_assigned_from_representative_name() {
    let provider = SharedProvider::new(vec![
        MemoryBackend::new("local", &[("payroll_2024.xlsx", b"P")]),
        MemoryBackend::new("ftps", &[("holiday.jpg", b"H")]),
    ]);
    let engine = engine(provider);
    engine.trigger_sync().unwrap();

    for file in engine.list_files() {
        let expected = if file.name.starts_with("payroll") {
            Sensitivity::Sensitive
        } else {
            Sensitivity::Insensitive
        };
        assert_eq!(file.sensitivity, expected);
    }
}

#[test]
fn test_collect_descriptors_does_not_publish() {
    let engine = engine(SharedProvider::new(three_backends()));
    let enumeration = engine.collect_descriptors().unwrap();

    assert_eq!(enumeration.descriptors.len(), 3);
    assert_eq!(enumeration.available, 3);
    assert!(engine.list_files().is_empty());
    assert_eq!(engine.phase(), SyncPhase::Idle);
}

#[test]
fn test_list_files_before_sync_is_empty() {
    let engine = engine(SharedProvider::new(three_backends()));
    assert!(engine.list_files().is_empty());
}

#[test]
fn test_backend_still_busy_is_not_handed_a_second_worker() {
    let mut stuck = MemoryBackend::new("ftps", &[("big.iso", b"I")]);
    stuck.fetch_delay = Duration::from_millis(1500);
    let fetches = Arc::clone(&stuck.fetches);
    let provider = SharedProvider::new(vec![MemoryBackend::new("local", &[("a.txt", b"X")]), stuck]);
    let engine = engine(provider).with_timeout(Duration::from_millis(200));

    let first = engine.sync(&SilentReporter).unwrap();
    assert_eq!(first.degraded[0].backend, "ftps");
    assert!(first.degraded[0].reason.contains("timed out"));

    for _ in 0..2 {
        let report = engine.sync(&SilentReporter).unwrap();
        assert_eq!(report.descriptors_processed, 1);
        assert_eq!(report.degraded[0].backend, "ftps");
        assert!(report.degraded[0].reason.contains("still busy"));
    }
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    // Once the abandoned fetch returns, the backend is used again.
    thread::sleep(Duration::from_millis(1600));
    let report = engine.sync(&SilentReporter).unwrap();
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
    assert!(report.degraded.iter().all(|f| !f.reason.contains("still busy")));
}

#[test]
fn test_steady_progress_outlasts_timeout() {
    let files: Vec<(String, Vec<u8>)> = (0..8)
        .map(|i| (format!("f{}.txt", i), vec![i as u8]))
        .collect();
    let mut steady = MemoryBackend::new("local", &[]);
    steady.files = files;
    steady.fetch_delay = Duration::from_millis(60);
    let engine = engine(SharedProvider::new(vec![steady])).with_timeout(Duration::from_millis(200));

    let report = engine.sync(&SilentReporter).unwrap();
    assert!(report.duration > Duration::from_millis(200));
    assert_eq!(report.descriptors_processed, 8);
    assert!(report.degraded.is_empty());
}

#[test]
fn test_listed_content_hash_skips_download_and_matches_local_bytes() {
    let mut remote = MemoryBackend::new("dropbox", &[("Backup/report.pdf", b"quarterly numbers")]);
    remote.hinted = true;
    let fetches = Arc::clone(&remote.fetches);
    let provider = SharedProvider::new(vec![
        MemoryBackend::new("local", &[("docs/report.pdf", b"quarterly numbers")]),
        remote,
    ]);
    let engine = engine_with(provider, Arc::new(AlwaysDifferent));

    let report = engine.sync(&SilentReporter).unwrap();
    assert!(report.degraded.is_empty());
    assert_eq!(fetches.load(Ordering::SeqCst), 0);

    let files = engine.list_files();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].locations, vec!["dropbox", "local"]);
    assert_eq!(files[0].fingerprint.as_str(), content_hash(b"quarterly numbers").to_lowercase());
}

#[test]
fn test_sensitive_text_content_flags_file() {
    let provider = SharedProvider::new(vec![
        MemoryBackend::new("local", &[("memo.txt", b"Draft salary bands for 2025")]),
        MemoryBackend::new("ftps", &[("menu.txt", b"soup of the day")]),
    ]);
    let engine = engine(provider);
    engine.trigger_sync().unwrap();

    let files = engine.list_files();
    let memo = files.iter().find(|f| f.name == "memo.txt").unwrap();
    assert_eq!(memo.sensitivity, Sensitivity::Sensitive);
    let menu = files.iter().find(|f| f.name == "menu.txt").unwrap();
    assert_eq!(menu.sensitivity, Sensitivity::Insensitive);
}
