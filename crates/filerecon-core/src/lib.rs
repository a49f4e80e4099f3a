pub mod backend;
pub mod classifier;
pub mod cluster;
pub mod compare;
pub mod config;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod progress;
pub mod registry;
pub mod sensitivity;

pub use backend::{BackendFailure, BackendKind, RawEntry, StorageBackend};
pub use classifier::{IdentityClassifier, Label, LogisticModel, Prediction};
pub use config::AppConfig;
pub use descriptor::{FileDescriptor, Fingerprint};
pub use engine::{BackendProvider, ConfiguredBackends, Enumeration, SyncEngine, SyncPhase, SyncReport};
pub use error::{BackendError, ClassifierError, Error};
pub use progress::{ProgressReporter, SilentReporter};
pub use registry::{FileRegistry, LogicalFile, LogicalFileSummary};
pub use sensitivity::{KeywordClassifier, Sensitivity, SensitivityClassifier};
