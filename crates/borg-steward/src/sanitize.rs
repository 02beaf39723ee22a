use std::sync::OnceLock;

use regex::Regex;

const MAX_LINE_CHARS: usize = 4096;
const REDACTED: &str = "[redacted]";

fn escape_sequences() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // CSI, OSC (BEL or ST terminated), then DCS/SOS/PM/APC strings, then lone ESC+byte.
        Regex::new(concat!(
            r"\x1b\[[0-?]*[ -/]*[@-~]",
            r"|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)",
            r"|\x1b[PX^_][^\x1b]*\x1b\\",
            r"|\x1b.?",
        ))
        .expect("static escape regex")
    })
}

fn is_format_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

/// Make one line of tool output safe to log or forward as a status attribute.
pub fn sanitize_line(input: &str) -> String {
    let stripped = escape_sequences().replace_all(input, "");
    let mut out = String::with_capacity(stripped.len().min(MAX_LINE_CHARS));
    let mut count = 0usize;
    for c in stripped.chars() {
        if c == '\t' {
            out.push(' ');
        } else if c.is_control() || is_format_control(c) {
            continue;
        } else {
            out.push(c);
        }
        count += 1;
        if count >= MAX_LINE_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }
    out
}

/// Replaces every occurrence of a secret with a marker. Empty secrets are ignored.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut secrets: Vec<String> = secrets
            .into_iter()
            .map(Into::into)
            .filter(|s| !s.trim().is_empty())
            .collect();
        // Longest first so a secret containing another is replaced whole.
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        Self { secrets }
    }

    pub fn redact(&self, line: &str) -> String {
        let mut out = line.to_string();
        for s in &self.secrets {
            if out.contains(s.as_str()) {
                out = out.replace(s.as_str(), REDACTED);
            }
        }
        out
    }

    pub fn clean(&self, line: &str) -> String {
        self.redact(&sanitize_line(line))
    }
}
