//! Activity signals pushed by the editor integration.
//!
//! These are raw observations; the debouncer decides which of them become
//! heartbeats.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the developer was doing when the activity was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Category {
    #[default]
    #[serde(rename = "coding")]
    Coding,
    #[serde(rename = "building")]
    Building,
    #[serde(rename = "indexing")]
    Indexing,
    #[serde(rename = "debugging")]
    Debugging,
    #[serde(rename = "running tests")]
    RunningTests,
    #[serde(rename = "writing tests")]
    WritingTests,
    #[serde(rename = "manual testing")]
    ManualTesting,
    #[serde(rename = "code reviewing")]
    CodeReviewing,
    #[serde(rename = "browsing")]
    Browsing,
    #[serde(rename = "designing")]
    Designing,
}

impl Category {
    /// Name used on the wire and on the CLI command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Coding => "coding",
            Category::Building => "building",
            Category::Indexing => "indexing",
            Category::Debugging => "debugging",
            Category::RunningTests => "running tests",
            Category::WritingTests => "writing tests",
            Category::ManualTesting => "manual testing",
            Category::CodeReviewing => "code reviewing",
            Category::Browsing => "browsing",
            Category::Designing => "designing",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single observation of developer activity on a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    /// Path of the document; blank means the event is malformed
    #[serde(default)]
    pub file_path: String,
    /// Project the document belongs to
    #[serde(default)]
    pub project: Option<String>,
    /// Editor language id
    #[serde(default)]
    pub language: Option<String>,
    /// When the activity happened
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// True for saves, false for edits and opens
    #[serde(default)]
    pub is_write: bool,
    /// Zero-based line of the edit, when known
    #[serde(default)]
    pub lineno: Option<u64>,
    /// Zero-based column of the edit, when known
    #[serde(default)]
    pub cursor_pos: Option<u64>,
    /// Activity category; `coding` when absent
    #[serde(default)]
    pub category: Option<Category>,
}

impl ActivityEvent {
    /// Create an edit event for `file_path` observed now.
    pub fn edit(file_path: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            project: None,
            language: None,
            timestamp: Utc::now(),
            is_write: false,
            lineno: None,
            cursor_pos: None,
            category: None,
        }
    }

    /// Create a save event for `file_path` observed now.
    pub fn save(file_path: impl Into<String>) -> Self {
        Self {
            is_write: true,
            ..Self::edit(file_path)
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_cursor(mut self, lineno: u64, cursor_pos: u64) -> Self {
        self.lineno = Some(lineno);
        self.cursor_pos = Some(cursor_pos);
        self
    }

    /// Whether the event is missing the fields a heartbeat needs.
    pub fn is_malformed(&self) -> bool {
        self.file_path.trim().is_empty()
    }
}
