use ahash::AHashSet;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::sync::Arc;

use crate::config::SensitivityConfig;
use crate::error::ClassifierError;

const DEFAULT_KEYWORDS: &[&str] = &[
    "password",
    "passport",
    "ssn",
    "salary",
    "payroll",
    "confidential",
    "medical",
    "diagnosis",
    "bank",
    "iban",
    "credit card",
    "tax",
    "contract",
    "private",
];

const DEFAULT_EXTENSIONS: &[&str] = &[".pem", ".key", ".p12", ".pfx", ".kdbx", ".asc", ".gpg"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Sensitivity {
    Sensitive,
    Insensitive,
}

impl fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sensitivity::Sensitive => f.write_str("SENSITIVE"),
            Sensitivity::Insensitive => f.write_str("INSENSITIVE"),
        }
    }
}

pub trait SensitivityClassifier: Send + Sync {
    /// `content` is a leading text sample when one was captured.
    fn classify(&self, file_name: &str, content: Option<&str>) -> Sensitivity;
}

/// Keyword file layout.
#[derive(Debug, Default, Deserialize)]
struct KeywordFile {
    #[serde(default)]
    sensitive_keywords: Vec<String>,
    #[serde(default)]
    sensitive_extensions: Vec<String>,
}

/// Flags names with a sensitive extension or a sensitive keyword that stands
/// on its own (bounded by non-alphanumerics), ignoring case. Text content is
/// matched against the same keywords unless content scanning is turned off.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    extensions: AHashSet<String>,
    pattern: Option<Regex>,
    scan_content: bool,
}

impl KeywordClassifier {
    pub fn new<K, E>(keywords: K, extensions: E) -> Result<Self, ClassifierError>
    where
        K: IntoIterator,
        K::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        let extensions = extensions
            .into_iter()
            .map(|ext| normalize_extension(ext.as_ref()))
            .filter(|ext| ext.len() > 1)
            .collect();

        let alternatives: Vec<String> = keywords
            .into_iter()
            .map(|kw| kw.as_ref().trim().to_string())
            .filter(|kw| !kw.is_empty())
            .map(|kw| regex::escape(&kw))
            .collect();

        let pattern = if alternatives.is_empty() {
            None
        } else {
            let source = format!(
                "(?:^|[^A-Za-z0-9])(?:{})(?:$|[^A-Za-z0-9])",
                alternatives.join("|")
            );
            let regex = RegexBuilder::new(&source)
                .case_insensitive(true)
                .build()
                .map_err(|e| ClassifierError::Artifact(e.to_string()))?;
            Some(regex)
        };

        Ok(Self {
            extensions,
            pattern,
            scan_content: true,
        })
    }

    pub fn with_content_scan(mut self, enabled: bool) -> Self {
        self.scan_content = enabled;
        self
    }

    pub fn builtin() -> Result<Self, ClassifierError> {
        Self::new(DEFAULT_KEYWORDS.iter(), DEFAULT_EXTENSIONS.iter())
    }

    /// Merge the keyword file (if any) with inline lists; fall back to the
    /// built-in lists when nothing is configured.
    pub fn from_config(config: &SensitivityConfig) -> Result<Self, ClassifierError> {
        let mut file = KeywordFile::default();
        if let Some(path) = &config.keywords_path {
            let raw = fs::read_to_string(path)
                .map_err(|e| ClassifierError::Artifact(format!("{}: {}", path, e)))?;
            file = serde_json::from_str(&raw)
                .map_err(|e| ClassifierError::Artifact(format!("{}: {}", path, e)))?;
        }

        let mut keywords = file.sensitive_keywords;
        keywords.extend(config.keywords.iter().cloned());
        let mut extensions = file.sensitive_extensions;
        extensions.extend(config.extensions.iter().cloned());

        let classifier = if keywords.is_empty() && extensions.is_empty() {
            Self::builtin()?
        } else {
            Self::new(keywords, extensions)?
        };
        Ok(classifier.with_content_scan(config.scan_content))
    }
}

impl SensitivityClassifier for KeywordClassifier {
    fn classify(&self, file_name: &str, content: Option<&str>) -> Sensitivity {
        let lower = file_name.to_lowercase();
        if let Some(dot) = lower.rfind('.') {
            if self.extensions.contains(&lower[dot..]) {
                return Sensitivity::Sensitive;
            }
        }
        let Some(pattern) = &self.pattern else {
            return Sensitivity::Insensitive;
        };
        if pattern.is_match(file_name) {
            return Sensitivity::Sensitive;
        }
        match content {
            Some(text) if self.scan_content && pattern.is_match(text) => Sensitivity::Sensitive,
            _ => Sensitivity::Insensitive,
        }
    }
}

pub fn load_sensitivity(
    config: &SensitivityConfig,
) -> Result<Arc<dyn SensitivityClassifier>, ClassifierError> {
    Ok(Arc::new(KeywordClassifier::from_config(config)?))
}

fn normalize_extension(ext: &str) -> String {
    let ext = ext.trim().to_lowercase();
    if ext.starts_with('.') {
        ext
    } else {
        format!(".{}", ext)
    }
}
