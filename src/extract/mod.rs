//! Snapshot extraction strategies.
//!
//! Each strategy is a pure function from full-screen terminal text to an
//! ordered list of role-tagged fragments. Strategies are selected by tool
//! identity; the tool-agnostic [`GenericExtractor`] is the fallback when the
//! driven CLI is unknown.

mod claude;
mod generic;
mod marker;

pub use claude::ClaudeCodeExtractor;
pub use generic::GenericExtractor;
pub use marker::MarkerScanExtractor;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Who produced a span of conversation text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    /// Synthetic lifecycle boundary (session start, clear, interrupt, exit).
    System,
}

/// One role-tagged span produced by a single extraction pass. Transient:
/// never stored directly, always folded through the reconciler first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fragment {
    pub role: Role,
    pub content: String,
}

impl Fragment {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A pure, deterministic extraction strategy. Safe to call repeatedly with
/// the same input.
pub trait SnapshotExtractor: Send + Sync {
    fn extract(&self, screen_text: &str) -> Vec<Fragment>;
}

/// Which extraction strategy to run for a given tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractorKind {
    MarkerScan,
    ClaudeCode,
    Generic,
}

impl ExtractorKind {
    /// Map a driven tool's identity to its extraction strategy.
    /// Unknown tools get the generic fallback.
    pub fn for_tool(tool: &str) -> Self {
        match tool.trim().to_ascii_lowercase().as_str() {
            "claude" | "claude-code" => ExtractorKind::ClaudeCode,
            "aider" | "codex" => ExtractorKind::MarkerScan,
            _ => ExtractorKind::Generic,
        }
    }

    pub fn build(self) -> Box<dyn SnapshotExtractor> {
        match self {
            ExtractorKind::MarkerScan => Box::new(MarkerScanExtractor::new()),
            ExtractorKind::ClaudeCode => Box::new(ClaudeCodeExtractor::new()),
            ExtractorKind::Generic => Box::new(GenericExtractor::new()),
        }
    }
}

/// CSI sequences (colors, cursor movement) and OSC sequences (titles).
static ANSI_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)").unwrap());

/// Remove terminal escape sequences, keeping only printable text.
pub fn strip_ansi(text: &str) -> String {
    ANSI_PATTERN.replace_all(text, "").into_owned()
}

/// Accumulates lines for the currently open run and flushes them into
/// finished fragments. Shared rules live here: leading/trailing blank lines
/// are trimmed and fragments that are empty after trimming are dropped.
#[derive(Debug, Default)]
pub(crate) struct RunBuffer {
    role: Option<Role>,
    lines: Vec<String>,
}

impl RunBuffer {
    pub(crate) fn open(&mut self, role: Role, out: &mut Vec<Fragment>) {
        if self.role != Some(role) {
            self.flush(out);
        }
        self.role = Some(role);
    }

    pub(crate) fn is_open(&self) -> bool {
        self.role.is_some()
    }

    pub(crate) fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub(crate) fn flush(&mut self, out: &mut Vec<Fragment>) {
        let role = match self.role.take() {
            Some(r) => r,
            None => {
                self.lines.clear();
                return;
            }
        };
        let lines = std::mem::take(&mut self.lines);
        let content = join_trimmed(&lines);
        if !content.is_empty() {
            out.push(Fragment::new(role, content));
        }
    }
}

/// Join run lines, dropping leading/trailing blank lines and trailing
/// per-line whitespace.
pub(crate) fn join_trimmed(lines: &[String]) -> String {
    let start = lines
        .iter()
        .position(|l| !l.trim().is_empty())
        .unwrap_or(lines.len());
    let end = lines
        .iter()
        .rposition(|l| !l.trim().is_empty())
        .map(|i| i + 1)
        .unwrap_or(start);
    lines[start..end]
        .iter()
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
        .trim_start()
        .to_string()
}
