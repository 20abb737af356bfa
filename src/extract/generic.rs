//! Tool-agnostic fallback extraction.
//!
//! Knows nothing about any specific CLI's conventions. A box-drawing frame
//! whose first content line begins with a prompt chevron is a user input
//! frame; known activity glyphs start assistant output; shell prompts and
//! lone `%` lines are noise. Anything else outside a recognized frame
//! accretes onto the current assistant run.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{strip_ansi, Fragment, Role, RunBuffer, SnapshotExtractor};

static FRAME_TOP: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*[╭┌]─+[╮┐]?\s*$").unwrap());
static FRAME_BOTTOM: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*[╰└]─+[╯┘]?\s*$").unwrap());

/// Activity glyphs that open assistant output: response bullets, spinner
/// frames, info markers.
static ACTIVITY_START: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[⏺●✻✽✶✳✢·ℹ]\s+(\S.*)$").unwrap());

static SHELL_PROMPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:\S*@\S+[^%$]*|~\S*\s+|/\S+\s+)?[%$](?:\s+.*)?$").unwrap());

static SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[─━═]+$").unwrap());

pub struct GenericExtractor;

impl GenericExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Strip the `│ ... │` borders from one frame interior line.
    fn frame_interior(line: &str) -> String {
        let mut s = line.trim_end();
        if let Some(rest) = s.strip_suffix('│').or_else(|| s.strip_suffix('|')) {
            s = rest.trim_end();
        }
        let t = s.trim_start();
        if let Some(rest) = t.strip_prefix('│').or_else(|| t.strip_prefix('|')) {
            rest.to_string()
        } else {
            s.to_string()
        }
    }

    /// Remove the common leading indentation of the non-empty lines.
    fn deindent(lines: &[String]) -> Vec<String> {
        let indent = lines
            .iter()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.len() - l.trim_start().len())
            .min()
            .unwrap_or(0);
        lines
            .iter()
            .map(|l| if l.len() >= indent { l[indent..].to_string() } else { l.trim_start().to_string() })
            .collect()
    }
}

impl Default for GenericExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotExtractor for GenericExtractor {
    fn extract(&self, screen_text: &str) -> Vec<Fragment> {
        if screen_text.trim().is_empty() {
            return Vec::new();
        }

        let mut out = Vec::new();
        let mut run = RunBuffer::default();
        let mut frame: Option<Vec<String>> = None;

        for raw in screen_text.lines() {
            let stripped = strip_ansi(raw);
            let t = stripped.trim();

            if frame.is_some() {
                if FRAME_BOTTOM.is_match(&stripped) {
                    let interior = frame.take().unwrap_or_default();
                    let first = interior.iter().find(|l| !l.trim().is_empty());
                    let is_user_frame = first
                        .map(|l| {
                            let f = l.trim_start();
                            f.starts_with('>') || f.starts_with('❯')
                        })
                        .unwrap_or(false);
                    if is_user_frame {
                        run.flush(&mut out);
                        // Chevron comes off the opening line; the rest keeps
                        // its shape relative to its own common indent.
                        let mut cleaned = Vec::new();
                        let mut rest = Vec::new();
                        for l in interior {
                            if cleaned.is_empty() {
                                if l.trim().is_empty() {
                                    continue;
                                }
                                let f = l.trim_start();
                                let c = f
                                    .strip_prefix('>')
                                    .or_else(|| f.strip_prefix('❯'))
                                    .unwrap_or(f);
                                cleaned.push(c.trim_start().to_string());
                            } else {
                                rest.push(l);
                            }
                        }
                        cleaned.extend(Self::deindent(&rest));
                        run.open(Role::User, &mut out);
                        for l in cleaned {
                            run.push(l);
                        }
                        run.flush(&mut out);
                    } else {
                        // A frame without a chevron is some other boxed UI:
                        // its content accretes like any unrecognized text.
                        run.open(Role::Assistant, &mut out);
                        for l in interior {
                            run.push(l);
                        }
                    }
                } else if let Some(interior) = frame.as_mut() {
                    interior.push(Self::frame_interior(&stripped));
                }
                continue;
            }

            if FRAME_TOP.is_match(&stripped) {
                frame = Some(Vec::new());
                continue;
            }

            // Shell prompts and lone % are terminal noise, never conversation.
            if t == "%" || SHELL_PROMPT.is_match(t) {
                run.flush(&mut out);
                continue;
            }

            if SEPARATOR.is_match(t) {
                run.flush(&mut out);
                continue;
            }

            if let Some(caps) = ACTIVITY_START.captures(t) {
                run.flush(&mut out);
                run.open(Role::Assistant, &mut out);
                run.push(caps.get(1).map_or("", |m| m.as_str()));
                continue;
            }

            if t.is_empty() {
                if run.is_open() {
                    run.push("");
                }
                continue;
            }

            // Default: accrete onto the current assistant run.
            run.open(Role::Assistant, &mut out);
            run.push(stripped.trim_end());
        }

        // A frame left open at end-of-input still counts as content.
        if let Some(interior) = frame.take() {
            run.open(Role::Assistant, &mut out);
            for l in interior {
                run.push(l);
            }
        }

        run.flush(&mut out);
        out
    }
}
