//! Extraction and parsing of `<signals>` blocks embedded in generator
//! output.
//!
//! The generator is instructed to append structured observations as one or
//! more `<signals>{...}</signals>` blocks. Models do not always comply
//! with strict JSON, so parsing degrades through three strategies:
//!
//! 1. strict `serde_json` parse of the block body;
//! 2. a brace-counting walk (respecting strings and escapes) that locates
//!    the outermost `{...}`, repairing missing closers;
//! 3. a tolerant scan that extracts top-level `key: value` pairs even when
//!    keys are unquoted.
//!
//! Maps from multiple blocks merge left-to-right; later keys win.

use serde_json::{Map, Value};

/// Literal opening tag prefix. Streaming suppression keys off this, so a
/// block is recognized as soon as `<signals` has been produced.
pub const TAG_PREFIX: &str = "<signals";
/// Full opening tag.
pub const OPEN_TAG: &str = "<signals>";
/// Full closing tag.
pub const CLOSE_TAG: &str = "</signals>";

/// Result of scanning one full response for signal blocks.
#[derive(Debug, Default)]
pub struct ParsedSignals {
    /// Merged signal map, keyed by the raw (unprefixed) signal name.
    pub signals: Map<String, Value>,
    /// Number of blocks that defeated all three parse strategies.
    pub failed_blocks: usize,
}

/// Scan a complete response for `<signals>` blocks and parse each one.
pub fn parse_signal_blocks(text: &str) -> ParsedSignals {
    let mut parsed = ParsedSignals::default();
    for block in signal_block_bodies(text) {
        match parse_block(block) {
            Some(map) => parsed.signals.extend(map),
            None => parsed.failed_blocks += 1,
        }
    }
    parsed
}

/// The speakable part of a response: everything before the first
/// `<signals` tag, trimmed.
pub fn spoken_text(text: &str) -> String {
    match text.find(TAG_PREFIX) {
        Some(idx) => text[..idx].trim().to_owned(),
        None => text.trim().to_owned(),
    }
}

/// Bodies of all non-overlapping `<signals>...</signals>` blocks,
/// case-sensitive, in order of appearance.
fn signal_block_bodies(text: &str) -> Vec<&str> {
    let mut bodies = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find(OPEN_TAG) {
        let after_open = &rest[open + OPEN_TAG.len()..];
        match after_open.find(CLOSE_TAG) {
            Some(close) => {
                bodies.push(&after_open[..close]);
                rest = &after_open[close + CLOSE_TAG.len()..];
            }
            None => {
                // Unterminated block: take everything to end of stream.
                bodies.push(after_open);
                break;
            }
        }
    }
    bodies
}

/// Parse one block body, degrading through the three strategies.
fn parse_block(body: &str) -> Option<Map<String, Value>> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        return Some(map);
    }

    if let Some(candidate) = balanced_object(trimmed)
        && let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&candidate)
    {
        return Some(map);
    }

    let tolerant = tolerant_object(trimmed);
    if tolerant.is_empty() {
        None
    } else {
        Some(tolerant)
    }
}

/// Locate the outermost `{...}` with a brace-counting walk that respects
/// string literals and escapes. When the text ends before the object
/// closes, the missing closers are appended.
fn balanced_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..=start + i].to_owned());
                }
            }
            _ => {}
        }
    }

    // Ran out of input mid-object: repair by closing what is open.
    let mut repaired = text[start..].trim_end().to_owned();
    repaired.extend(std::iter::repeat_n('}', depth));
    Some(repaired)
}

/// Tolerant scan: extract top-level `key: value` pairs from degraded
/// near-JSON, accepting unquoted keys and bare scalar values.
fn tolerant_object(text: &str) -> Map<String, Value> {
    let chars: Vec<char> = text.chars().collect();
    let mut pos = 0usize;
    // Step inside a leading brace when present.
    skip_whitespace(&chars, &mut pos);
    if chars.get(pos) == Some(&'{') {
        pos += 1;
    }
    parse_pairs(&chars, &mut pos)
}

fn parse_pairs(chars: &[char], pos: &mut usize) -> Map<String, Value> {
    let mut map = Map::new();
    loop {
        skip_separators(chars, pos);
        match chars.get(*pos) {
            None => break,
            Some('}') => {
                *pos += 1;
                break;
            }
            _ => {}
        }

        let Some(key) = parse_key(chars, pos) else {
            // Unparseable junk: advance one char so the scan terminates.
            *pos += 1;
            continue;
        };
        skip_whitespace(chars, pos);
        if chars.get(*pos) != Some(&':') {
            continue;
        }
        *pos += 1;
        skip_whitespace(chars, pos);
        let value = parse_value(chars, pos);
        map.insert(key, value);
    }
    map
}

fn parse_key(chars: &[char], pos: &mut usize) -> Option<String> {
    skip_whitespace(chars, pos);
    match chars.get(*pos) {
        Some('"') => parse_string(chars, pos),
        Some(_) => {
            let start = *pos;
            while let Some(&c) = chars.get(*pos) {
                if c == ':' || c == ',' || c == '}' {
                    break;
                }
                *pos += 1;
            }
            let key: String = chars[start..*pos].iter().collect::<String>().trim().to_owned();
            if key.is_empty() { None } else { Some(key) }
        }
        None => None,
    }
}

fn parse_value(chars: &[char], pos: &mut usize) -> Value {
    match chars.get(*pos) {
        Some('{') => {
            *pos += 1;
            Value::Object(parse_pairs(chars, pos))
        }
        Some('[') => {
            let raw = take_balanced(chars, pos, '[', ']');
            serde_json::from_str(&raw).unwrap_or(Value::String(raw))
        }
        Some('"') => parse_string(chars, pos).map_or(Value::Null, Value::String),
        Some(_) => {
            let start = *pos;
            while let Some(&c) = chars.get(*pos) {
                if c == ',' || c == '}' {
                    break;
                }
                *pos += 1;
            }
            let token: String = chars[start..*pos].iter().collect::<String>().trim().to_owned();
            serde_json::from_str(&token).unwrap_or(Value::String(token))
        }
        None => Value::Null,
    }
}

/// Consume a double-quoted string, returning its unescaped body.
fn parse_string(chars: &[char], pos: &mut usize) -> Option<String> {
    if chars.get(*pos) != Some(&'"') {
        return None;
    }
    *pos += 1;
    let mut out = String::new();
    while let Some(&c) = chars.get(*pos) {
        *pos += 1;
        match c {
            '"' => return Some(out),
            '\\' => {
                if let Some(&next) = chars.get(*pos) {
                    *pos += 1;
                    match next {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        other => out.push(other),
                    }
                }
            }
            other => out.push(other),
        }
    }
    // Unterminated string: return what we have.
    Some(out)
}

/// Consume a balanced bracket run (respecting strings), repairing a
/// missing closer at end of input.
fn take_balanced(chars: &[char], pos: &mut usize, open: char, close: char) -> String {
    let mut out = String::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    while let Some(&c) = chars.get(*pos) {
        *pos += 1;
        out.push(c);
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            c2 if c2 == open && !in_string => depth += 1,
            c2 if c2 == close && !in_string => {
                depth -= 1;
                if depth == 0 {
                    return out;
                }
            }
            _ => {}
        }
    }
    out.extend(std::iter::repeat_n(close, depth));
    out
}

fn skip_whitespace(chars: &[char], pos: &mut usize) {
    while chars.get(*pos).is_some_and(|c| c.is_whitespace()) {
        *pos += 1;
    }
}

fn skip_separators(chars: &[char], pos: &mut usize) {
    while chars
        .get(*pos)
        .is_some_and(|c| c.is_whitespace() || *c == ',')
    {
        *pos += 1;
    }
}

/// Incrementally suppresses everything from the first `<signals` tag
/// onward across streaming fragments.
///
/// Feed raw token text through [`push`](Self::push); the return value is
/// the newly speakable text. Once the tag has been seen nothing further is
/// emitted. The scanner holds back any trailing bytes that could be the
/// start of a split tag, so a tag broken across two tokens is still
/// caught.
#[derive(Debug, Default)]
pub struct SignalTagScanner {
    carry: String,
    tag_seen: bool,
}

impl SignalTagScanner {
    /// Feed one fragment and return the newly speakable text.
    pub fn push(&mut self, fragment: &str) -> String {
        if self.tag_seen {
            return String::new();
        }
        self.carry.push_str(fragment);

        if let Some(start) = self.carry.find(TAG_PREFIX) {
            let visible = self.carry[..start].to_owned();
            self.tag_seen = true;
            self.carry.clear();
            return visible;
        }

        let keep = partial_tag_suffix(&self.carry);
        let emit = self.carry.len() - keep;
        let visible = self.carry[..emit].to_owned();
        self.carry.drain(..emit);
        visible
    }

    /// Flush the speakable tail at end of stream.
    pub fn finish(&mut self) -> String {
        if self.tag_seen {
            self.carry.clear();
            return String::new();
        }
        std::mem::take(&mut self.carry)
    }

    /// Whether the opening tag has been observed.
    pub fn tag_seen(&self) -> bool {
        self.tag_seen
    }
}

/// Length in bytes of the longest suffix of `text` that is a proper
/// prefix of the opening tag.
fn partial_tag_suffix(text: &str) -> usize {
    let max = TAG_PREFIX.len().saturating_sub(1).min(text.len());
    for len in (1..=max).rev() {
        if text.ends_with(&TAG_PREFIX[..len]) {
            return len;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use serde_json::json;

    // ── block extraction ─────────────────────────────────────────────

    #[test]
    fn strict_block_round_trips() {
        let text = "All done. <signals>{\"intake.done\": {\"score\": 3}}</signals>";
        let parsed = parse_signal_blocks(text);
        assert_eq!(parsed.failed_blocks, 0);
        assert_eq!(parsed.signals["intake.done"], json!({"score": 3}));
    }

    #[test]
    fn surrounding_text_is_ignored() {
        let text = "preamble <signals>{\"a\": 1}</signals> trailing chatter";
        let parsed = parse_signal_blocks(text);
        assert_eq!(parsed.signals["a"], json!(1));
    }

    #[test]
    fn later_blocks_override_earlier_keys() {
        let text = "<signals>{\"a\": 1, \"b\": 2}</signals> and \
                    <signals>{\"b\": 3, \"c\": 4}</signals>";
        let parsed = parse_signal_blocks(text);
        assert_eq!(parsed.signals["a"], json!(1));
        assert_eq!(parsed.signals["b"], json!(3));
        assert_eq!(parsed.signals["c"], json!(4));
    }

    #[test]
    fn unterminated_block_parses_to_end() {
        let text = "Done. <signals>{\"wrap\": true}";
        let parsed = parse_signal_blocks(text);
        assert_eq!(parsed.signals["wrap"], json!(true));
    }

    #[test]
    fn no_blocks_yields_empty_map() {
        let parsed = parse_signal_blocks("just words, no structure");
        assert!(parsed.signals.is_empty());
        assert_eq!(parsed.failed_blocks, 0);
    }

    // ── degraded parsing ─────────────────────────────────────────────

    #[test]
    fn brace_walk_ignores_braces_in_strings() {
        let text = "<signals>noise {\"label\": \"value {x}\"} more noise</signals>";
        let parsed = parse_signal_blocks(text);
        assert_eq!(parsed.signals["label"], json!("value {x}"));
    }

    #[test]
    fn unbalanced_unquoted_block_recovers() {
        let text = "<signals>{a:1, b:{c:2}</signals>";
        let parsed = parse_signal_blocks(text);
        assert_eq!(parsed.failed_blocks, 0);
        assert_eq!(parsed.signals["a"], json!(1));
        assert_eq!(parsed.signals["b"], json!({"c": 2}));
    }

    #[test]
    fn tolerant_scan_handles_bare_scalars() {
        let text = "<signals>{done: true, mood: \"calm\", score: 2.5}</signals>";
        let parsed = parse_signal_blocks(text);
        assert_eq!(parsed.signals["done"], json!(true));
        assert_eq!(parsed.signals["mood"], json!("calm"));
        assert_eq!(parsed.signals["score"], json!(2.5));
    }

    #[test]
    fn hopeless_block_counts_as_failed() {
        let parsed = parse_signal_blocks("<signals>,,,</signals>");
        assert!(parsed.signals.is_empty());
        assert_eq!(parsed.failed_blocks, 1);
    }

    // ── spoken text ──────────────────────────────────────────────────

    #[test]
    fn spoken_text_stops_at_tag_prefix() {
        let text = "Thanks for sharing. <signals>{\"a\": 1}</signals>";
        assert_eq!(spoken_text(text), "Thanks for sharing.");
    }

    #[test]
    fn spoken_text_without_tag_is_whole_reply() {
        assert_eq!(spoken_text("  Hello there.  "), "Hello there.");
    }

    // ── streaming scanner ────────────────────────────────────────────

    #[test]
    fn scanner_passes_plain_text() {
        let mut scanner = SignalTagScanner::default();
        let mut out = scanner.push("hello world");
        out.push_str(&scanner.finish());
        assert_eq!(out, "hello world");
        assert!(!scanner.tag_seen());
    }

    #[test]
    fn scanner_suppresses_after_tag() {
        let mut scanner = SignalTagScanner::default();
        let mut out = scanner.push("before <signals>{\"a\":");
        out.push_str(&scanner.push("1}</signals> after"));
        out.push_str(&scanner.finish());
        assert_eq!(out, "before ");
        assert!(scanner.tag_seen());
    }

    #[test]
    fn scanner_catches_tag_split_across_fragments() {
        let mut scanner = SignalTagScanner::default();
        let mut out = scanner.push("okay <sig");
        out.push_str(&scanner.push("nals>{\"x\": 1}"));
        out.push_str(&scanner.finish());
        assert_eq!(out, "okay ");
        assert!(scanner.tag_seen());
    }

    #[test]
    fn scanner_releases_false_tag_prefix() {
        let mut scanner = SignalTagScanner::default();
        let mut out = scanner.push("a <sig");
        out.push_str(&scanner.push("nificant point"));
        out.push_str(&scanner.finish());
        assert_eq!(out, "a <significant point");
        assert!(!scanner.tag_seen());
    }
}
