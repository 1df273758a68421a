//! Progress reporting.

use tracing::{error, info, Level};

/// Receives human-facing progress lines.
///
/// Implementations must not fail; a broken UI never aborts a build.
pub trait Ui: Send + Sync {
    /// A top-level progress line.
    fn say(&self, message: &str);

    /// A detail line under the current step.
    fn message(&self, message: &str);

    /// An error line.
    fn error(&self, message: &str);
}

/// Writes UI lines to the tracing subscriber.
#[derive(Debug, Clone)]
pub struct TracingUi {
    level: Level,
}

impl Default for TracingUi {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl TracingUi {
    /// Creates a UI logging progress at `level`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }
}

impl Ui for TracingUi {
    fn say(&self, message: &str) {
        if self.level == Level::DEBUG {
            tracing::debug!(ui = "say", "{}", message);
        } else {
            info!(ui = "say", "{}", message);
        }
    }

    fn message(&self, message: &str) {
        if self.level == Level::DEBUG {
            tracing::debug!(ui = "message", "{}", message);
        } else {
            info!(ui = "message", "{}", message);
        }
    }

    fn error(&self, message: &str) {
        error!(ui = "error", "{}", message);
    }
}

/// A UI that keeps every line, for tests.
#[derive(Debug, Default)]
pub struct RecordingUi {
    lines: parking_lot::RwLock<Vec<(UiLevel, String)>>,
}

/// Which channel a recorded line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiLevel {
    /// `say`
    Say,
    /// `message`
    Message,
    /// `error`
    Error,
}

impl RecordingUi {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All lines in arrival order.
    #[must_use]
    pub fn lines(&self) -> Vec<(UiLevel, String)> {
        self.lines.read().clone()
    }

    /// Lines reported through `error`.
    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        self.lines
            .read()
            .iter()
            .filter(|(level, _)| *level == UiLevel::Error)
            .map(|(_, line)| line.clone())
            .collect()
    }

    /// Whether any line contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.read().iter().any(|(_, line)| line.contains(needle))
    }
}

impl Ui for RecordingUi {
    fn say(&self, message: &str) {
        self.lines.write().push((UiLevel::Say, message.to_string()));
    }

    fn message(&self, message: &str) {
        self.lines.write().push((UiLevel::Message, message.to_string()));
    }

    fn error(&self, message: &str) {
        self.lines.write().push((UiLevel::Error, message.to_string()));
    }
}
