use crate::backend::{build_backend, BackendFailure, IgnoreSet, StorageBackend};
use crate::classifier::{self, IdentityClassifier, Label};
use crate::cluster::UnionFind;
use crate::compare::{self, DecisionSource, IdentityDecision};
use crate::config::{AppConfig, BackendConfig};
use crate::descriptor::{self, FileDescriptor, Fingerprint};
use crate::error::{BackendError, Error};
use crate::progress::{ProgressReporter, SilentReporter};
use crate::registry::{self, FileRegistry, LogicalFileSummary, RegistrySnapshot};
use crate::sensitivity::{self, SensitivityClassifier};
use ahash::AHashMap;
use chrono::Utc;
use dashmap::DashMap;
use rayon::prelude::*;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const COMPARE_PROGRESS_STEP: usize = 4096;

/// Supplies fresh, unconnected backends at the start of every run.
pub trait BackendProvider: Send + Sync {
    fn backends(&self) -> Vec<Box<dyn StorageBackend>>;
}

/// Backends described by configuration.
pub struct ConfiguredBackends {
    configs: Vec<BackendConfig>,
    base_folder: String,
    timeout: Duration,
}

impl ConfiguredBackends {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            configs: config.backends.clone(),
            base_folder: config.base_folder.clone(),
            timeout: config.backend_timeout(),
        }
    }
}

impl BackendProvider for ConfiguredBackends {
    fn backends(&self) -> Vec<Box<dyn StorageBackend>> {
        self.configs
            .iter()
            .map(|c| build_backend(c, &self.base_folder, self.timeout))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Connecting,
    Enumerating,
    Comparing,
    Clustering,
    Published,
    Failed,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone)]
pub struct SyncReport {
    /// Descriptors that made it into the registry, across all backends.
    pub descriptors_processed: usize,
    pub logical_files: usize,
    pub comparisons: usize,
    pub classifier_fallbacks: usize,
    /// Backends that dropped out, or lost entries, during the run.
    pub degraded: Vec<BackendFailure>,
    pub duration: Duration,
}

/// Descriptors gathered from every reachable backend.
#[derive(Debug, Clone, Default)]
pub struct Enumeration {
    pub descriptors: Vec<FileDescriptor>,
    pub degraded: Vec<BackendFailure>,
    /// Backends that connected and completed their listing.
    pub available: usize,
}

struct BackendListing {
    descriptors: Vec<FileDescriptor>,
    dropped: Vec<BackendFailure>,
}

type StageResult<T> = Result<(Box<dyn StorageBackend>, T), BackendError>;
type StageOutput<T> = Vec<(String, StageResult<T>)>;

enum StageEvent<T> {
    /// The worker made progress; its deadline starts over.
    Beat(usize),
    Done(usize, StageResult<T>),
}

/// Workers abandoned after missing a deadline, by backend id. A backend is
/// not handed a new worker until its abandoned one has exited.
#[derive(Default)]
struct Workers(Mutex<AHashMap<String, JoinHandle<()>>>);

impl Workers {
    fn is_busy(&self, backend: &str) -> bool {
        let mut abandoned = self.0.lock().unwrap_or_else(|e| e.into_inner());
        match abandoned.get(backend) {
            Some(handle) if !handle.is_finished() => true,
            Some(_) => {
                if let Some(handle) = abandoned.remove(backend) {
                    let _ = handle.join();
                }
                false
            }
            None => false,
        }
    }

    fn abandon(&self, backend: &str, handle: JoinHandle<()>) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(backend.to_string(), handle);
    }
}

pub struct SyncEngine {
    provider: Box<dyn BackendProvider>,
    classifier: Arc<dyn IdentityClassifier>,
    sensitivity: Arc<dyn SensitivityClassifier>,
    registry: Arc<FileRegistry>,
    ignore: Arc<IgnoreSet>,
    timeout: Duration,
    run_lock: Mutex<()>,
    phase: Mutex<SyncPhase>,
    workers: Workers,
}

impl SyncEngine {
    pub fn new(
        provider: impl BackendProvider + 'static,
        classifier: Arc<dyn IdentityClassifier>,
        sensitivity: Arc<dyn SensitivityClassifier>,
    ) -> Self {
        Self {
            provider: Box::new(provider),
            classifier,
            sensitivity,
            registry: Arc::new(FileRegistry::new()),
            ignore: Arc::new(IgnoreSet::default()),
            timeout: AppConfig::default().backend_timeout(),
            run_lock: Mutex::new(()),
            phase: Mutex::new(SyncPhase::Idle),
            workers: Workers::default(),
        }
    }

    /// Engine wired to the configured backends, classifiers and the
    /// process-wide registry.
    pub fn from_config(config: &AppConfig) -> Result<Self, Error> {
        config.validate()?;
        let classifier = classifier::load_classifier(&config.classifier)?;
        let sensitivity = sensitivity::load_sensitivity(&config.sensitivity)?;
        Ok(Self::new(ConfiguredBackends::new(config), classifier, sensitivity)
            .with_registry(registry::global())
            .with_timeout(config.backend_timeout())
            .with_ignore_patterns(&config.ignore_patterns))
    }

    pub fn with_registry(mut self, registry: Arc<FileRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// How long a backend may go without progress: the bound on connecting,
    /// on listing, and on each file fetched after that.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_ignore_patterns(mut self, globs: &[String]) -> Self {
        self.ignore = Arc::new(IgnoreSet::new(globs));
        self
    }

    pub fn registry(&self) -> Arc<FileRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run one reconciliation cycle and return the number of descriptors
    /// processed.
    pub fn trigger_sync(&self) -> Result<usize, Error> {
        self.sync(&SilentReporter).map(|report| report.descriptors_processed)
    }

    /// Current registry contents; empty if no sync has completed.
    pub fn list_files(&self) -> Vec<LogicalFileSummary> {
        self.registry.list_files()
    }

    /// Enumerate every backend without clustering or publishing.
    pub fn collect_descriptors(&self) -> Result<Enumeration, Error> {
        let enumeration = self.enumerate(&SilentReporter, false);
        if enumeration.available == 0 {
            return Err(Error::NoBackendsAvailable {
                failures: enumeration.degraded,
            });
        }
        Ok(enumeration)
    }

    /// Run the full pipeline:
    /// 1. Connect to all backends concurrently
    /// 2. List and fingerprint each backend's files
    /// 3. Compare cross-backend pairs in parallel
    /// 4. Union exact matches and `same` decisions
    /// 5. Publish the new registry
    pub fn sync(&self, reporter: &dyn ProgressReporter) -> Result<SyncReport, Error> {
        let _run = match self.run_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(Error::SyncInProgress),
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
        };
        let started = Instant::now();

        let Enumeration {
            descriptors,
            degraded,
            available,
        } = self.enumerate(reporter, true);

        if available == 0 {
            self.set_phase(SyncPhase::Failed);
            warn!("No backend could be reached; keeping the previous registry");
            return Err(Error::NoBackendsAvailable { failures: degraded });
        }

        // Phase: compare
        self.set_phase(SyncPhase::Comparing);
        info!("Comparing {} descriptors...", descriptors.len());
        let compare_start = Instant::now();
        let (same, comparisons, fallbacks) = self.compare_all(&descriptors, reporter);
        reporter.on_compare_complete(same.len(), compare_start.elapsed().as_secs_f64());
        debug!(
            "Compare completed in {:.2}s: {} pairs, {} same, {} fallbacks",
            compare_start.elapsed().as_secs_f64(),
            comparisons,
            same.len(),
            fallbacks,
        );

        // Phase: cluster
        self.set_phase(SyncPhase::Clustering);
        let groups = cluster(&descriptors, &same);
        let files = registry::materialize(&descriptors, &groups, self.sensitivity.as_ref());
        let logical_files = files.len();

        self.registry.publish(RegistrySnapshot {
            files,
            descriptors_processed: descriptors.len(),
            degraded: degraded.clone(),
            completed_at: Utc::now(),
        });
        self.set_phase(SyncPhase::Published);
        reporter.on_publish(logical_files, descriptors.len());

        for failure in &degraded {
            warn!("Degraded: {}", failure);
        }
        info!(
            "Published {} logical files from {} descriptors ({} backends degraded)",
            logical_files,
            descriptors.len(),
            degraded.len(),
        );

        Ok(SyncReport {
            descriptors_processed: descriptors.len(),
            logical_files,
            comparisons,
            classifier_fallbacks: fallbacks,
            degraded,
            duration: started.elapsed(),
        })
    }

    fn set_phase(&self, phase: SyncPhase) {
        debug!("Sync phase: {}", phase);
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    fn enumerate(&self, reporter: &dyn ProgressReporter, track_phase: bool) -> Enumeration {
        let backends = self.provider.backends();
        reporter.on_connect_start(backends.len());
        if track_phase {
            self.set_phase(SyncPhase::Connecting);
        }

        // Phase: connect
        info!("Connecting to {} backends...", backends.len());
        let mut degraded = Vec::new();
        let mut live = Vec::new();
        let connected = run_stage(backends, self.timeout, &self.workers, |b, _| b.connect());
        for (id, result) in connected {
            match result {
                Ok((backend, ())) => {
                    debug!("Connected to {} ({})", id, backend.kind());
                    reporter.on_backend_connected(&id);
                    live.push(backend);
                }
                Err(e) => {
                    warn!("Backend {} unavailable: {}", id, e);
                    reporter.on_backend_failed(&id, &e.to_string());
                    degraded.push(BackendFailure::new(&id, &e));
                }
            }
        }

        // Phase: enumerate
        if track_phase {
            self.set_phase(SyncPhase::Enumerating);
        }
        let enumerate_start = Instant::now();
        let ignore = Arc::clone(&self.ignore);
        let mut descriptors = Vec::new();
        let mut available = 0;
        let listed = run_stage(live, self.timeout, &self.workers, move |b, beat| {
            enumerate_backend(b, &ignore, beat)
        });
        for (id, result) in listed {
            match result {
                Ok((backend, listing)) => {
                    debug!(
                        "{} descriptors from {} ({})",
                        listing.descriptors.len(),
                        id,
                        backend.kind()
                    );
                    available += 1;
                    descriptors.extend(listing.descriptors);
                    degraded.extend(listing.dropped);
                }
                Err(e) => {
                    warn!("Listing {} failed: {}", id, e);
                    reporter.on_backend_failed(&id, &e.to_string());
                    degraded.push(BackendFailure::new(&id, &e));
                }
            }
        }

        descriptors.sort_by(|a, b| (&a.backend_id, &a.path).cmp(&(&b.backend_id, &b.path)));
        degraded.sort_by(|a, b| a.backend.cmp(&b.backend));
        reporter.on_enumerate_complete(descriptors.len(), enumerate_start.elapsed().as_secs_f64());
        debug!(
            "Enumeration completed in {:.2}s: {} descriptors from {} backends",
            enumerate_start.elapsed().as_secs_f64(),
            descriptors.len(),
            available,
        );

        Enumeration {
            descriptors,
            degraded,
            available,
        }
    }

    /// Every cross-backend pair through the comparator. Returns the `same`
    /// decisions, the number of comparisons, and how many fell back to
    /// `different` on classifier errors.
    fn compare_all(
        &self,
        descriptors: &[FileDescriptor],
        reporter: &dyn ProgressReporter,
    ) -> (Vec<IdentityDecision>, usize, usize) {
        let total = cross_backend_pairs(descriptors);
        reporter.on_compare_start(total);

        let classifier = self.classifier.as_ref();
        let done = AtomicUsize::new(0);
        let fallbacks = AtomicUsize::new(0);
        let n = descriptors.len();

        let same: Vec<IdentityDecision> = (0..n)
            .into_par_iter()
            .flat_map_iter(|i| {
                ((i + 1)..n)
                    .filter(move |&j| descriptors[i].backend_id != descriptors[j].backend_id)
                    .map(move |j| compare::decide(descriptors, i, j, classifier))
            })
            .filter(|decision| {
                let count = done.fetch_add(1, Ordering::Relaxed) + 1;
                if count % COMPARE_PROGRESS_STEP == 0 {
                    reporter.on_compare_progress(count, total);
                }
                if decision.source == DecisionSource::Fallback {
                    fallbacks.fetch_add(1, Ordering::Relaxed);
                }
                decision.label == Label::Same
            })
            .collect();

        (same, done.into_inner(), fallbacks.into_inner())
    }
}

/// Union exact fingerprint matches (within and across backends) and every
/// `same` decision, returning the resulting index groups.
fn cluster(descriptors: &[FileDescriptor], same: &[IdentityDecision]) -> Vec<Vec<usize>> {
    let by_fingerprint: DashMap<&Fingerprint, Vec<usize>> = DashMap::new();
    descriptors.par_iter().enumerate().for_each(|(i, d)| {
        by_fingerprint.entry(&d.fingerprint).or_default().push(i);
    });

    let mut uf = UnionFind::new(descriptors.len());
    for entry in by_fingerprint.iter() {
        let members = entry.value();
        for &other in &members[1..] {
            uf.union(members[0], other);
        }
    }
    for decision in same {
        uf.union(decision.left, decision.right);
    }
    uf.groups()
}

fn cross_backend_pairs(descriptors: &[FileDescriptor]) -> usize {
    let mut per_backend: AHashMap<&str, usize> = AHashMap::new();
    for d in descriptors {
        *per_backend.entry(d.backend_id.as_str()).or_default() += 1;
    }
    let n = descriptors.len();
    let same_backend: usize = per_backend.values().map(|&c| c * c).sum();
    (n * n - same_backend) / 2
}

fn enumerate_backend(
    backend: &mut dyn StorageBackend,
    ignore: &IgnoreSet,
    beat: &dyn Fn(),
) -> Result<BackendListing, BackendError> {
    let listing = list_and_extract(backend, ignore, beat);
    backend.close();
    listing
}

fn list_and_extract(
    backend: &mut dyn StorageBackend,
    ignore: &IgnoreSet,
    beat: &dyn Fn(),
) -> Result<BackendListing, BackendError> {
    let entries = backend.list()?;
    beat();
    let mut descriptors = Vec::with_capacity(entries.len());
    let mut dropped = Vec::new();

    for entry in entries.iter().filter(|e| !ignore.is_ignored(&e.path)) {
        match descriptor::extract(backend, entry) {
            Ok(d) => descriptors.push(d),
            Err(BackendError::NotFound { backend, path }) => {
                warn!("{} vanished from {} before it could be read", path, backend);
            }
            Err(e) => {
                warn!("Dropping {} from {}: {}", entry.path, backend.id(), e);
                dropped.push(BackendFailure::new(backend.id(), &e));
            }
        }
        beat();
    }

    Ok(BackendListing {
        descriptors,
        dropped,
    })
}

/// Run `work` on every backend, each on its own thread. A worker that goes
/// `timeout` without finishing or calling its heartbeat is reported as timed
/// out and parked in `workers`; the backend is reported busy until it exits.
/// Results come back in input order.
fn run_stage<T, F>(
    backends: Vec<Box<dyn StorageBackend>>,
    timeout: Duration,
    workers: &Workers,
    work: F,
) -> StageOutput<T>
where
    T: Send + 'static,
    F: Fn(&mut dyn StorageBackend, &dyn Fn()) -> Result<T, BackendError> + Send + Sync + 'static,
{
    let work = Arc::new(work);
    let (tx, rx) = mpsc::channel();
    let ids: Vec<String> = backends.iter().map(|b| b.id().to_string()).collect();
    let mut results: Vec<Option<StageResult<T>>> = ids.iter().map(|_| None).collect();
    let mut deadlines: Vec<Option<Instant>> = ids.iter().map(|_| None).collect();
    let mut handles: Vec<Option<JoinHandle<()>>> = ids.iter().map(|_| None).collect();
    let mut pending = 0;

    for (slot, mut backend) in backends.into_iter().enumerate() {
        if workers.is_busy(&ids[slot]) {
            warn!("{} is still busy with an earlier run, skipping it", ids[slot]);
            results[slot] = Some(Err(BackendError::unavailable(
                &ids[slot],
                "still busy with an earlier run",
            )));
            continue;
        }

        let tx = tx.clone();
        let work = Arc::clone(&work);
        let spawned = thread::Builder::new()
            .name(format!("backend-{}", ids[slot]))
            .spawn(move || {
                let beat_tx = tx.clone();
                let beat = move || {
                    let _ = beat_tx.send(StageEvent::Beat(slot));
                };
                let result = work(backend.as_mut(), &beat);
                let result = result.map(|value| (backend, value));
                let _ = tx.send(StageEvent::Done(slot, result));
            });
        match spawned {
            Ok(handle) => {
                handles[slot] = Some(handle);
                deadlines[slot] = Some(Instant::now() + timeout);
                pending += 1;
            }
            Err(e) => {
                results[slot] = Some(Err(BackendError::unavailable(&ids[slot], e)));
            }
        }
    }
    drop(tx);

    while pending > 0 {
        let Some(next) = deadlines.iter().flatten().min().copied() else {
            break;
        };
        match rx.recv_timeout(next.saturating_duration_since(Instant::now())) {
            Ok(StageEvent::Beat(slot)) => {
                if deadlines[slot].is_some() {
                    deadlines[slot] = Some(Instant::now() + timeout);
                }
            }
            Ok(StageEvent::Done(slot, result)) => {
                if deadlines[slot].take().is_some() {
                    results[slot] = Some(result);
                    pending -= 1;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                let now = Instant::now();
                for slot in 0..ids.len() {
                    if !matches!(deadlines[slot], Some(deadline) if deadline <= now) {
                        continue;
                    }
                    deadlines[slot] = None;
                    pending -= 1;
                    results[slot] = Some(Err(BackendError::Timeout {
                        backend: ids[slot].clone(),
                        after: timeout,
                    }));
                    if let Some(handle) = handles[slot].take() {
                        workers.abandon(&ids[slot], handle);
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    ids.into_iter()
        .zip(results)
        .map(|(id, result)| {
            let result = result.unwrap_or_else(|| {
                Err(BackendError::unavailable(&id, "worker exited without a result"))
            });
            (id, result)
        })
        .collect()
}
