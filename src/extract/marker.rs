//! Marker-scan extraction: two fixed line-anchored start markers, one per
//! role. The buffer is split at every marker occurrence into contiguous runs;
//! the marker that opened a run decides its role. Content is kept
//! byte-for-byte, including embedded control sequences, trimmed only at the
//! run edges.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{Fragment, Role, SnapshotExtractor};

/// User turn: prompt glyph + reset sequence at line start.
static USER_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^> \x1b\[0m").unwrap());

/// Assistant turn: colored bullet + reset at line start. The SGR color
/// prefix is optional so pre-stripped snapshots still split correctly.
static ASSISTANT_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(?:\x1b\[[0-9;]*m)?⏺\x1b\[0m").unwrap());

pub struct MarkerScanExtractor;

impl MarkerScanExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MarkerScanExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotExtractor for MarkerScanExtractor {
    fn extract(&self, screen_text: &str) -> Vec<Fragment> {
        if screen_text.trim().is_empty() {
            return Vec::new();
        }

        // Every marker occurrence, in buffer order.
        let mut markers: Vec<(usize, usize, Role)> = USER_MARKER
            .find_iter(screen_text)
            .map(|m| (m.start(), m.end(), Role::User))
            .chain(
                ASSISTANT_MARKER
                    .find_iter(screen_text)
                    .map(|m| (m.start(), m.end(), Role::Assistant)),
            )
            .collect();
        markers.sort_by_key(|&(start, _, _)| start);

        let mut fragments = Vec::new();
        for (i, &(_, end, role)) in markers.iter().enumerate() {
            let run_end = markers
                .get(i + 1)
                .map(|&(next_start, _, _)| next_start)
                .unwrap_or(screen_text.len());
            let content = screen_text[end..run_end].trim();
            if !content.is_empty() {
                fragments.push(Fragment::new(role, content));
            }
        }
        fragments
    }
}
