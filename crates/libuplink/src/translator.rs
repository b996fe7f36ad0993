use std::time::SystemTime;

use tokio::time::{Duration, Instant};

use uplink_protocol::{PromptDescriptor, PromptKind};

/// One unit of classified subprocess output.
#[derive(Debug, PartialEq, Eq)]
pub enum Classified {
    /// A complete line that matched no prompt rule.
    Log(String),
    /// A detected request for operator input.
    Prompt(PromptDescriptor),
}

/// Incremental classifier for the wrapped tool's text output.
///
/// Holds a rolling buffer of raw bytes. Complete lines either match a prompt
/// rule or are drained as log lines; a non-newline-terminated tail is held
/// until it matches a rule, more output arrives, or the idle threshold
/// expires and the tail is surfaced as a best-effort free-text prompt.
///
/// Rule evaluation is ordered and deterministic: secret markers, then y/n
/// pairs, then choice lists. Text matching several rules resolves to the
/// first, never to a best-match score.
pub struct PromptTranslator {
    buffer: Vec<u8>,
    next_id: u64,
    last_activity: Instant,
    idle_threshold: Duration,
    /// Labels of consecutive numbered menu lines, pending a selection tail.
    menu: Vec<String>,
}

impl PromptTranslator {
    pub fn new(idle_threshold: Duration) -> Self {
        Self {
            buffer: Vec::new(),
            next_id: 1,
            last_activity: Instant::now(),
            idle_threshold,
            menu: Vec::new(),
        }
    }

    /// Append a chunk of subprocess output to the rolling buffer.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        self.last_activity = Instant::now();
    }

    /// Classify the next unit of buffered output, if one can be confirmed.
    /// Call repeatedly until `None`.
    pub fn poll(&mut self) -> Option<Classified> {
        if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..=pos).collect();
            let raw = String::from_utf8_lossy(&line_bytes);
            let line = strip_ansi(raw.trim_end_matches(['\n', '\r']));

            if let Some(prompt) = self.match_prompt(line.trim_end()) {
                self.menu.clear();
                return Some(Classified::Prompt(prompt));
            }
            if let Some(label) = numbered_option(&line) {
                self.menu.push(label);
            } else if !line.trim().is_empty() {
                self.menu.clear();
            }
            return Some(Classified::Log(line));
        }

        // Partial trailing content: only the distinctive rules may fire
        // before a newline confirms the line is done. Anything else is held.
        if self.buffer.is_empty() {
            return None;
        }
        let tail = strip_ansi(&String::from_utf8_lossy(&self.buffer));
        let tail = tail.trim();
        if tail.is_empty() {
            return None;
        }
        if let Some(prompt) = self.match_prompt(tail) {
            self.buffer.clear();
            self.menu.clear();
            return Some(Classified::Prompt(prompt));
        }
        None
    }

    /// Whether unconsumed content is being held back.
    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Instant at which held content should be surfaced as a stall prompt.
    pub fn idle_deadline(&self) -> Option<Instant> {
        self.has_pending()
            .then(|| self.last_activity + self.idle_threshold)
    }

    /// Take whatever is still buffered, for flushing to the log sink when
    /// the subprocess exits mid-line.
    pub fn drain_remainder(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let text = strip_ansi(&String::from_utf8_lossy(&self.buffer))
            .trim_end()
            .to_string();
        self.buffer.clear();
        self.menu.clear();
        (!text.is_empty()).then_some(text)
    }

    /// Surface held, unrecognized content as a best-effort free-text prompt
    /// once the subprocess has been quiet past the idle threshold.
    pub fn take_stalled(&mut self) -> Option<PromptDescriptor> {
        if self.buffer.is_empty() || self.last_activity.elapsed() < self.idle_threshold {
            return None;
        }
        let text = strip_ansi(&String::from_utf8_lossy(&self.buffer))
            .trim()
            .to_string();
        self.buffer.clear();
        self.menu.clear();
        if text.is_empty() {
            return None;
        }
        Some(self.descriptor(PromptKind::FreeText, text, Vec::new(), None))
    }

    fn match_prompt(&mut self, line: &str) -> Option<PromptDescriptor> {
        if line.is_empty() {
            return None;
        }
        if is_secret_prompt(line) {
            return Some(self.descriptor(PromptKind::Secret, line.to_string(), Vec::new(), None));
        }
        if let Some(default) = detect_yes_no(line) {
            let default_value = default.map(|yes| if yes { "y" } else { "n" }.to_string());
            return Some(self.descriptor(
                PromptKind::YesNo,
                line.to_string(),
                Vec::new(),
                default_value,
            ));
        }
        if let Some(options) = detect_bracketed_choice(line) {
            return Some(self.descriptor(PromptKind::Choice, line.to_string(), options, None));
        }
        if is_menu_tail(line) && !self.menu.is_empty() {
            let options = std::mem::take(&mut self.menu);
            return Some(self.descriptor(PromptKind::Choice, line.to_string(), options, None));
        }
        None
    }

    fn descriptor(
        &mut self,
        kind: PromptKind,
        text: String,
        options: Vec<String>,
        default_value: Option<String>,
    ) -> PromptDescriptor {
        let id = self.next_id;
        self.next_id += 1;
        PromptDescriptor {
            id,
            kind,
            text,
            options,
            default_value,
            created_at_epoch_ms: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }
}

/// Phrases marking masked input. Checked before the y/n rules so
/// "enter password (y to abort)" style text never leaks an echoing prompt.
const SECRET_MARKERS: &[&str] = &["password", "passphrase", "2fa code", "api key"];

fn is_secret_prompt(line: &str) -> bool {
    let lower = line.trim_end().to_lowercase();
    if !lower.ends_with(':') {
        return false;
    }
    SECRET_MARKERS.iter().any(|marker| lower.contains(marker))
}

fn is_yes_no_letter(c: char) -> bool {
    // 's' pairs with 'n' in the tool's sim/nao prompts.
    matches!(c.to_ascii_lowercase(), 'y' | 'n' | 's')
}

/// Detect a y/n pair. Returns the default answer when exactly one side is
/// highlighted uppercase ("[Y/n]" defaults to yes), `Some(None)` when the
/// pair carries no default.
fn detect_yes_no(line: &str) -> Option<Option<bool>> {
    let chars: Vec<char> = line.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        if c != '/' {
            continue;
        }
        let prev = chars[..i].iter().rposition(|p| !p.is_whitespace())?;
        let next = i + 1 + chars[i + 1..].iter().position(|n| !n.is_whitespace())?;
        let (a, b) = (chars[prev], chars[next]);
        if !is_yes_no_letter(a) || !is_yes_no_letter(b) {
            continue;
        }
        // Both letters must be standalone tokens, not word tails ("try/not").
        if prev > 0 && chars[prev - 1].is_alphanumeric() {
            continue;
        }
        if next + 1 < chars.len() && chars[next + 1].is_alphanumeric() {
            continue;
        }
        let a_yes = matches!(a.to_ascii_lowercase(), 'y' | 's');
        let b_yes = matches!(b.to_ascii_lowercase(), 'y' | 's');
        if a_yes == b_yes {
            continue;
        }
        let default = match (a.is_uppercase(), b.is_uppercase()) {
            (true, false) => Some(a_yes),
            (false, true) => Some(b_yes),
            // Both highlighted: the tool leads with its preference.
            (true, true) => Some(a_yes),
            (false, false) => None,
        };
        return Some(default);
    }
    None
}

/// A bracketed option list like "[mkv/mp4/avi]". Two-element y/n brackets
/// never reach here; the y/n rule runs first.
fn detect_bracketed_choice(line: &str) -> Option<Vec<String>> {
    let open = line.rfind('[')?;
    let close = open + 1 + line[open + 1..].find(']')?;
    let inner = &line[open + 1..close];
    if inner.contains('[') {
        return None;
    }
    let parts: Vec<&str> = inner.split('/').map(str::trim).collect();
    if parts.len() < 2 || parts.iter().any(|p| p.is_empty() || p.len() > 32) {
        return None;
    }
    Some(parts.into_iter().map(str::to_string).collect())
}

/// The selection tail that follows a numbered menu.
fn is_menu_tail(line: &str) -> bool {
    let lower = line.trim().to_lowercase();
    lower == "selection:"
        || (lower.starts_with("select") && lower.ends_with(':'))
        || lower.starts_with("enter the number")
        || lower.starts_with("enter numbers")
}

/// Label of a numbered menu line ("3. Some Movie (2004)" -> "Some Movie (2004)").
fn numbered_option(line: &str) -> Option<String> {
    let trimmed = line.trim();
    let digits = trimmed.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let rest = trimmed[digits..]
        .strip_prefix('.')
        .or_else(|| trimmed[digits..].strip_prefix(')'))?;
    let label = rest.trim();
    (!label.is_empty()).then(|| label.to_string())
}

/// Drop ANSI CSI/OSC escape sequences; the wrapped tool colors its output.
fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\x1b' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                for n in chars.by_ref() {
                    if ('\x40'..='\x7e').contains(&n) {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                while let Some(n) = chars.next() {
                    if n == '\x07' {
                        break;
                    }
                    if n == '\x1b' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            _ => {
                chars.next();
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator() -> PromptTranslator {
        PromptTranslator::new(Duration::from_millis(500))
    }

    #[test]
    fn complete_lines_without_rules_are_logs() {
        let mut t = translator();
        t.push(b"Scanning files...\nFound 3 candidates\n");

        assert_eq!(
            t.poll(),
            Some(Classified::Log("Scanning files...".to_string()))
        );
        assert_eq!(
            t.poll(),
            Some(Classified::Log("Found 3 candidates".to_string()))
        );
        assert_eq!(t.poll(), None);
        assert!(!t.has_pending());
    }

    #[test]
    fn yes_no_prompt_on_partial_tail() {
        let mut t = translator();
        t.push(b"Continue? [y/n]: ");

        let prompt = match t.poll() {
            Some(Classified::Prompt(p)) => p,
            other => panic!("expected prompt, got {other:?}"),
        };
        assert_eq!(prompt.kind, PromptKind::YesNo);
        assert_eq!(prompt.text, "Continue? [y/n]:");
        assert_eq!(prompt.default_value, None);
        assert_eq!(prompt.id, 1);

        // Nothing further until new output arrives.
        assert_eq!(t.poll(), None);
        assert!(!t.has_pending());
    }

    #[test]
    fn uppercase_side_sets_default() {
        let mut t = translator();
        t.push(b"Overwrite existing torrent? (Y/n): ");
        match t.poll() {
            Some(Classified::Prompt(p)) => {
                assert_eq!(p.kind, PromptKind::YesNo);
                assert_eq!(p.default_value.as_deref(), Some("y"));
            }
            other => panic!("expected prompt, got {other:?}"),
        }

        let mut t = translator();
        t.push(b"Proceed? [s/N]: ");
        match t.poll() {
            Some(Classified::Prompt(p)) => {
                assert_eq!(p.default_value.as_deref(), Some("n"));
            }
            other => panic!("expected prompt, got {other:?}"),
        }
    }

    #[test]
    fn slash_inside_words_is_not_yes_no() {
        let mut t = translator();
        t.push(b"copying try/not important stuff\n");
        assert!(matches!(t.poll(), Some(Classified::Log(_))));
    }

    #[test]
    fn secret_marker_wins_over_free_text() {
        let mut t = translator();
        t.push(b"MTV 2FA code: ");
        match t.poll() {
            Some(Classified::Prompt(p)) => assert_eq!(p.kind, PromptKind::Secret),
            other => panic!("expected prompt, got {other:?}"),
        }
    }

    #[test]
    fn bracketed_list_is_choice() {
        let mut t = translator();
        t.push(b"Container format [mkv/mp4/avi]: ");
        match t.poll() {
            Some(Classified::Prompt(p)) => {
                assert_eq!(p.kind, PromptKind::Choice);
                assert_eq!(p.options, vec!["mkv", "mp4", "avi"]);
            }
            other => panic!("expected prompt, got {other:?}"),
        }
    }

    #[test]
    fn numbered_menu_feeds_selection_prompt() {
        let mut t = translator();
        t.push(b"Select the correct movie:\n");
        t.push(b"1. Heat (1995)\n2. Heat (2013)\n");
        t.push(b"Selection: ");

        assert!(matches!(t.poll(), Some(Classified::Log(_))));
        assert!(matches!(t.poll(), Some(Classified::Log(_))));
        assert!(matches!(t.poll(), Some(Classified::Log(_))));
        match t.poll() {
            Some(Classified::Prompt(p)) => {
                assert_eq!(p.kind, PromptKind::Choice);
                assert_eq!(p.options, vec!["Heat (1995)", "Heat (2013)"]);
            }
            other => panic!("expected prompt, got {other:?}"),
        }
    }

    #[test]
    fn partial_tail_without_rule_is_held() {
        let mut t = translator();
        t.push(b"Down");
        assert_eq!(t.poll(), None);
        assert!(t.has_pending());

        t.push(b"loading metadata\n");
        assert_eq!(
            t.poll(),
            Some(Classified::Log("Downloading metadata".to_string()))
        );
        assert!(!t.has_pending());
    }

    #[test]
    fn prompt_ids_are_monotonic() {
        let mut t = translator();
        t.push(b"Correct? [y/n]: ");
        let first = match t.poll() {
            Some(Classified::Prompt(p)) => p.id,
            other => panic!("expected prompt, got {other:?}"),
        };
        t.push(b"Upload anyway? [y/n]: ");
        let second = match t.poll() {
            Some(Classified::Prompt(p)) => p.id,
            other => panic!("expected prompt, got {other:?}"),
        };
        assert!(second > first);
    }

    #[test]
    fn stall_surfaces_held_tail_as_free_text() {
        let mut t = PromptTranslator::new(Duration::from_millis(50));
        t.push(b"Please enter new name: ");
        assert_eq!(t.poll(), None);
        assert!(t.take_stalled().is_none(), "must not fire before the idle threshold");

        std::thread::sleep(std::time::Duration::from_millis(80));
        let prompt = t.take_stalled().expect("stalled tail should surface");
        assert_eq!(prompt.kind, PromptKind::FreeText);
        assert_eq!(prompt.text, "Please enter new name:");
        assert!(!t.has_pending());
        assert!(t.take_stalled().is_none());
    }

    #[test]
    fn ansi_sequences_are_stripped() {
        let mut t = translator();
        t.push(b"\x1b[1;32mDone\x1b[0m uploading\n");
        assert_eq!(t.poll(), Some(Classified::Log("Done uploading".to_string())));

        let mut t = translator();
        t.push(b"\x1b[33mContinue? [y/n]:\x1b[0m ");
        match t.poll() {
            Some(Classified::Prompt(p)) => assert_eq!(p.kind, PromptKind::YesNo),
            other => panic!("expected prompt, got {other:?}"),
        }
    }

    #[test]
    fn newline_terminated_yes_no_still_prompts() {
        let mut t = translator();
        t.push(b"Continue with incomplete season pack? (y/n):\n");
        match t.poll() {
            Some(Classified::Prompt(p)) => assert_eq!(p.kind, PromptKind::YesNo),
            other => panic!("expected prompt, got {other:?}"),
        }
    }
}
