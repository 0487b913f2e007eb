//! Milestone detection over the restore tool's free-text output.

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_TABLE: &[(&str, &str)] = &[
    ("extract", r"\bextract"),
    ("send_restore_image", r"Sending\s+RestoreImage"),
    ("restore", r"\brestore\b"),
    ("flash", r"flashing"),
    ("verify", r"verif"),
    ("reboot", r"reboot"),
    ("wipe", r"wipe|erase"),
];

#[derive(Debug, Error)]
pub enum StepPatternError {
    #[error("read step patterns {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse step patterns {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid pattern for step '{name}': {source}")]
    InvalidPattern {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("duplicate step name '{0}'")]
    DuplicateName(String),

    #[error("step name must not be empty")]
    EmptyName,
}

#[derive(Debug, Clone)]
pub struct StepPattern {
    name: String,
    regex: Regex,
}

impl StepPattern {
    pub fn new(name: &str, pattern: &str) -> Result<Self, StepPatternError> {
        if name.trim().is_empty() {
            return Err(StepPatternError::EmptyName);
        }
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|source| StepPatternError::InvalidPattern {
                name: name.to_string(),
                source,
            })?;
        Ok(Self {
            name: name.to_string(),
            regex,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }
}

#[derive(Debug, Deserialize)]
struct PatternSpec {
    name: String,
    pattern: String,
}

/// Ordered milestone table with unique names.
#[derive(Debug, Clone)]
pub struct StepTable {
    patterns: Vec<StepPattern>,
}

impl Default for StepTable {
    fn default() -> Self {
        default_patterns()
    }
}

impl StepTable {
    pub fn new(patterns: Vec<StepPattern>) -> Result<Self, StepPatternError> {
        let mut seen = HashSet::new();
        for pattern in &patterns {
            if !seen.insert(pattern.name.as_str()) {
                return Err(StepPatternError::DuplicateName(pattern.name.clone()));
            }
        }
        Ok(Self { patterns })
    }

    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self, StepPatternError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let patterns = pairs
            .into_iter()
            .map(|(name, pattern)| StepPattern::new(name, pattern))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(patterns)
    }

    pub fn from_json(path: &Path, text: &str) -> Result<Self, StepPatternError> {
        let specs: Vec<PatternSpec> =
            serde_json::from_str(text).map_err(|source| StepPatternError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_pairs(
            specs
                .iter()
                .map(|spec| (spec.name.as_str(), spec.pattern.as_str())),
        )
    }

    pub fn patterns(&self) -> &[StepPattern] {
        &self.patterns
    }

    pub fn extractor(&self) -> StepExtractor {
        StepExtractor {
            table: self.clone(),
            fired: HashSet::new(),
        }
    }
}

pub fn default_patterns() -> StepTable {
    StepTable {
        patterns: DEFAULT_TABLE
            .iter()
            .filter_map(|(name, pattern)| StepPattern::new(name, pattern).ok())
            .collect(),
    }
}

/// Replaces the default table with `[{"name": ..., "pattern": ...}]` from a file.
pub fn load_patterns(path: impl AsRef<Path>) -> Result<StepTable, StepPatternError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| StepPatternError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    StepTable::from_json(path, &text)
}

/// Per-run matcher: each name fires at most once, on the first matching line.
#[derive(Debug, Clone)]
pub struct StepExtractor {
    table: StepTable,
    fired: HashSet<String>,
}

impl StepExtractor {
    /// Names newly fired by `line`, in table order.
    pub fn feed(&mut self, line: &str) -> Vec<String> {
        let mut names = Vec::new();
        for pattern in &self.table.patterns {
            if self.fired.contains(&pattern.name) || !pattern.regex.is_match(line) {
                continue;
            }
            self.fired.insert(pattern.name.clone());
            names.push(pattern.name.clone());
        }
        names
    }
}
