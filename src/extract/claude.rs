//! Stateful line-scan extraction for Claude-style TUIs.
//!
//! Walks the snapshot top to bottom with a small state machine
//! (`Idle | InUserFrame | InAssistantRun`) plus a shell-exit mode. User input
//! is a colored-background line prefixed with `> `; continuation lines carry
//! the same background with no prefix. Assistant output starts at a colored
//! bullet. Lifecycle boundaries (banner, `/clear`, interrupt, shell exit)
//! flush the open run and emit synthetic system fragments. Everything below
//! the bottom status line is transient UI chrome and is never scanned.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{strip_ansi, Fragment, Role, RunBuffer, SnapshotExtractor};

/// User input line: truecolor background + `> ` prefix. The background color
/// identifies continuation lines of the same input frame.
static USER_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\x1b\[48;2;([0-9;]+)m\s*> (.*)$").unwrap());

/// Pre-stripped snapshots lose the background color; fall back to a bare
/// prompt prefix with content.
static PLAIN_USER_START: Lazy<Regex> = Lazy::new(|| Regex::new(r"^> (\S.*)$").unwrap());

static BANNER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Welcome to Claude Code|Claude Code v\d").unwrap());

/// Transient spinner/status line (`✳ Determining… (3s · thinking)`).
static SPINNER_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[·✻✽✶✳✢]\s+\S").unwrap());

static SPINNER_ONLY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[·✻✽✶✳✢⠐⠂⠈⠁⠉⠃⠋⠓⠒⠖⠦⠤]+$").unwrap());

static SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[─━═]+$").unwrap());

static PROMPT_ONLY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[❯>]\s*$").unwrap());

/// Shell prompt with an optional trailing command (`user@host dir % cmd`,
/// `$ cmd`). Best-effort heuristic; `#` is excluded so markdown headings in
/// assistant output never read as prompts.
static SHELL_PROMPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:\S*@\S+[^%$]*|~\S*\s+|/\S+\s+)?[%$](?:\s+(.*))?$").unwrap());

/// IDE-selection block sentinels; interior lines are dropped wholesale.
const IDE_SELECTION_OPEN: &str = "<ide_selection>";
const IDE_SELECTION_CLOSE: &str = "</ide_selection>";

const SESSION_START: &str = "session start";
const SCREEN_REFRESH: &str = "screen refresh";
const INTERRUPTED: &str = "interrupted";
const EXIT: &str = "exit";

#[derive(Debug, Clone, PartialEq, Eq)]
enum ScanState {
    Idle,
    /// Inside a user input frame; the captured background color marks
    /// continuation lines.
    InUserFrame { bg: Option<String> },
    InAssistantRun,
}

pub struct ClaudeCodeExtractor;

impl ClaudeCodeExtractor {
    pub fn new() -> Self {
        Self
    }

    fn is_status_line(t: &str) -> bool {
        let lower = t.to_lowercase();
        lower.contains("esc to interrupt") || lower.contains("? for shortcuts") || t.starts_with("⏵⏵")
    }

    fn is_clear_command(t: &str) -> bool {
        let t = t
            .trim_start_matches('>')
            .trim_start_matches('❯')
            .trim_start();
        t == "/clear"
    }

    fn is_interrupt(t: &str) -> bool {
        (t.starts_with('⎿') && t.contains("Interrupted")) || t.starts_with('✖') || t.starts_with('✗')
    }

    fn push_system(out: &mut Vec<Fragment>, content: &str) {
        out.push(Fragment::new(Role::System, content));
    }
}

impl Default for ClaudeCodeExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotExtractor for ClaudeCodeExtractor {
    fn extract(&self, screen_text: &str) -> Vec<Fragment> {
        if screen_text.trim().is_empty() {
            return Vec::new();
        }

        let lines: Vec<&str> = screen_text.lines().collect();
        let mut out = Vec::new();
        let mut run = RunBuffer::default();
        let mut state = ScanState::Idle;
        let mut shell_mode = false;
        let mut in_ide_block = false;

        let mut i = 0;
        let mut rewound = false;
        while i < lines.len() {
            let raw = lines[i];
            let stripped = strip_ansi(raw);
            let t = stripped.trim();

            if in_ide_block {
                if t.contains(IDE_SELECTION_CLOSE) {
                    in_ide_block = false;
                }
                i += 1;
                continue;
            }
            if t.contains(IDE_SELECTION_OPEN) {
                run.flush(&mut out);
                state = ScanState::Idle;
                in_ide_block = !t.contains(IDE_SELECTION_CLOSE);
                i += 1;
                continue;
            }

            // Anything below the bottom status line is transient chrome.
            if Self::is_status_line(t) {
                break;
            }

            if BANNER_PATTERN.is_match(t) {
                run.flush(&mut out);
                state = ScanState::Idle;
                shell_mode = false;
                // A banner block can match on several lines; one boundary each
                // is enough, the session collapses exact repeats anyway.
                if out.last().map(|f| f.content.as_str()) != Some(SESSION_START) {
                    Self::push_system(&mut out, SESSION_START);
                }
                i += 1;
                rewound = false;
                continue;
            }

            if shell_mode {
                // The driven tool has exited to a plain shell: each prompt
                // line with a command becomes its own boundary fragment until
                // a banner brings the tool back.
                if let Some(caps) = SHELL_PROMPT.captures(t) {
                    if let Some(cmd) = caps.get(1).map(|m| m.as_str().trim()).filter(|c| !c.is_empty())
                    {
                        Self::push_system(&mut out, &format!("shell:{cmd}"));
                    }
                }
                i += 1;
                continue;
            }

            if Self::is_clear_command(t) {
                run.flush(&mut out);
                state = ScanState::Idle;
                Self::push_system(&mut out, SCREEN_REFRESH);
                i += 1;
                rewound = false;
                continue;
            }

            if Self::is_interrupt(t) {
                run.flush(&mut out);
                state = ScanState::Idle;
                Self::push_system(&mut out, INTERRUPTED);
                i += 1;
                rewound = false;
                continue;
            }

            if SHELL_PROMPT.is_match(t) && !PROMPT_ONLY.is_match(t) {
                run.flush(&mut out);
                state = ScanState::Idle;
                shell_mode = true;
                Self::push_system(&mut out, EXIT);
                if let Some(cmd) = SHELL_PROMPT
                    .captures(t)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().trim())
                    .filter(|c| !c.is_empty())
                {
                    Self::push_system(&mut out, &format!("shell:{cmd}"));
                }
                i += 1;
                rewound = false;
                continue;
            }

            // Transient chrome: spinners, separators, bare prompts.
            if SPINNER_LINE.is_match(t) || SPINNER_ONLY.is_match(t) || PROMPT_ONLY.is_match(t) {
                i += 1;
                rewound = false;
                continue;
            }
            if SEPARATOR.is_match(t) {
                run.flush(&mut out);
                state = ScanState::Idle;
                i += 1;
                rewound = false;
                continue;
            }

            // New user input frame.
            if let Some(caps) = USER_START.captures(raw) {
                run.flush(&mut out);
                let bg = caps.get(1).map(|m| m.as_str().to_string());
                let content = strip_ansi(caps.get(2).map_or("", |m| m.as_str()));
                state = ScanState::InUserFrame { bg };
                run.open(Role::User, &mut out);
                run.push(content.trim_end());
                i += 1;
                rewound = false;
                continue;
            }
            if let Some(caps) = PLAIN_USER_START.captures(t) {
                run.flush(&mut out);
                state = ScanState::InUserFrame { bg: None };
                run.open(Role::User, &mut out);
                run.push(caps.get(1).map_or("", |m| m.as_str()).trim_end());
                i += 1;
                rewound = false;
                continue;
            }

            // Continuation of the current user frame: same background color,
            // no prompt prefix required.
            if let ScanState::InUserFrame { bg: Some(bg) } = &state {
                let marker = format!("\x1b[48;2;{bg}m");
                if let Some(rest) = raw.strip_prefix(marker.as_str()) {
                    run.push(strip_ansi(rest).trim_end());
                    i += 1;
                    rewound = false;
                    continue;
                }
            }

            // Assistant output start: colored bullet glyph.
            if let Some(rest) = t.strip_prefix('⏺') {
                run.flush(&mut out);
                state = ScanState::InAssistantRun;
                run.open(Role::Assistant, &mut out);
                run.push(rest.trim());
                i += 1;
                rewound = false;
                continue;
            }

            match state {
                ScanState::InAssistantRun => {
                    // Pending lines accrete into the open assistant run.
                    run.push(stripped.trim_end());
                    i += 1;
                    rewound = false;
                }
                ScanState::InUserFrame { .. } => {
                    // The frame ended on a line that belongs to neither role:
                    // flush and re-examine this same line exactly once.
                    run.flush(&mut out);
                    state = ScanState::Idle;
                    if rewound {
                        i += 1;
                        rewound = false;
                    } else {
                        rewound = true;
                    }
                }
                ScanState::Idle => {
                    i += 1;
                    rewound = false;
                }
            }
        }

        run.flush(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(text: &str) -> Vec<Fragment> {
        ClaudeCodeExtractor::new().extract(text)
    }

    #[test]
    fn test_user_then_assistant() {
        let frags = extract(
            "\x1b[48;2;55;55;55m> hello\x1b[0m\n\x1b[38;2;1;2;3m⏺\x1b[0m hi there",
        );
        assert_eq!(
            frags,
            vec![
                Fragment::new(Role::User, "hello"),
                Fragment::new(Role::Assistant, "hi there"),
            ]
        );
    }

    #[test]
    fn test_user_frame_continuation_same_background() {
        let frags = extract(
            "\x1b[48;2;55;55;55m> first line\x1b[0m\n\x1b[48;2;55;55;55msecond line\x1b[0m\n\x1b[38;2;1;2;3m⏺\x1b[0m ok",
        );
        assert_eq!(frags[0], Fragment::new(Role::User, "first line\nsecond line"));
        assert_eq!(frags[1], Fragment::new(Role::Assistant, "ok"));
    }

    #[test]
    fn test_different_background_is_not_continuation() {
        let frags = extract(
            "\x1b[48;2;55;55;55m> input\x1b[0m\n\x1b[48;2;99;99;99mother ui element\x1b[0m",
        );
        // The second line has a different background: the user frame ends.
        assert_eq!(frags, vec![Fragment::new(Role::User, "input")]);
    }

    #[test]
    fn test_assistant_run_accretes_plain_lines() {
        let frags = extract("⏺ first paragraph\n  indented detail\n  more detail");
        assert_eq!(
            frags,
            vec![Fragment::new(
                Role::Assistant,
                "first paragraph\n  indented detail\n  more detail"
            )]
        );
    }

    #[test]
    fn test_banner_emits_session_start() {
        let frags = extract("✻ Welcome to Claude Code v2.1\n\n⏺ ready when you are");
        assert_eq!(frags[0], Fragment::new(Role::System, "session start"));
        assert_eq!(frags[1], Fragment::new(Role::Assistant, "ready when you are"));
    }

    #[test]
    fn test_clear_command_emits_screen_refresh() {
        let frags = extract("⏺ old answer\n> /clear\n⏺ fresh answer");
        assert_eq!(
            frags,
            vec![
                Fragment::new(Role::Assistant, "old answer"),
                Fragment::new(Role::System, "screen refresh"),
                Fragment::new(Role::Assistant, "fresh answer"),
            ]
        );
    }

    #[test]
    fn test_interrupt_glyph() {
        let frags = extract("⏺ working on it\n⎿  Interrupted by user");
        assert_eq!(
            frags,
            vec![
                Fragment::new(Role::Assistant, "working on it"),
                Fragment::new(Role::System, "interrupted"),
            ]
        );
    }

    #[test]
    fn test_shell_exit_and_commands() {
        let frags = extract(
            "⏺ goodbye\nuser@host ~/project % ls -la\nuser@host ~/project % git status\n✻ Welcome to Claude Code v2.1",
        );
        assert_eq!(
            frags,
            vec![
                Fragment::new(Role::Assistant, "goodbye"),
                Fragment::new(Role::System, "exit"),
                Fragment::new(Role::System, "shell:ls -la"),
                Fragment::new(Role::System, "shell:git status"),
                Fragment::new(Role::System, "session start"),
            ]
        );
    }

    #[test]
    fn test_ide_selection_block_dropped() {
        let frags = extract(
            "⏺ looking at your selection\n<ide_selection>\nfn private() {}\nsecret contents\n</ide_selection>\n⏺ done looking",
        );
        assert_eq!(
            frags,
            vec![
                Fragment::new(Role::Assistant, "looking at your selection"),
                Fragment::new(Role::Assistant, "done looking"),
            ]
        );
    }

    #[test]
    fn test_status_line_terminates_scan() {
        let frags = extract(
            "⏺ the actual answer\n⏵⏵ bypass permissions on (shift+tab to cycle) · esc to interrupt\n⏺ phantom chrome below the bar",
        );
        assert_eq!(frags, vec![Fragment::new(Role::Assistant, "the actual answer")]);
    }

    #[test]
    fn test_spinner_and_separator_chrome_skipped() {
        let frags = extract(
            "⏺ computing\n✳ Determining… (3s · thinking)\n  still computing\n────────────────────\n> \n",
        );
        // Spinner is dropped without breaking the run; separator flushes it.
        assert_eq!(
            frags,
            vec![Fragment::new(Role::Assistant, "computing\n  still computing")]
        );
    }

    #[test]
    fn test_user_frame_rewind_reexamines_line() {
        // The line after the user frame is an assistant bullet: the rewind
        // must re-classify it, not discard it.
        let frags = extract("\x1b[48;2;55;55;55m> question\x1b[0m\n⏺ answer");
        assert_eq!(
            frags,
            vec![
                Fragment::new(Role::User, "question"),
                Fragment::new(Role::Assistant, "answer"),
            ]
        );
    }

    #[test]
    fn test_empty_and_whitespace_input() {
        assert!(extract("").is_empty());
        assert!(extract("  \n \n").is_empty());
    }

    #[test]
    fn test_extraction_idempotent() {
        let s = "\x1b[48;2;10;10;10m> build\x1b[0m\n⏺ building\n  done\n> /clear";
        assert_eq!(extract(s), extract(s));
    }

    #[test]
    fn test_markdown_heading_not_shell_prompt() {
        let frags = extract("⏺ summary\n# Heading in output\nbody text");
        assert_eq!(
            frags,
            vec![Fragment::new(
                Role::Assistant,
                "summary\n# Heading in output\nbody text"
            )]
        );
    }
}
