//! Streaming tool-call extraction from model output.
//!
//! Model text arrives in arbitrary-sized chunks, including splits in the
//! middle of a JSON object. The extractor is a state machine over the
//! accumulated stream: it scans for textual evidence of a tool call (both a
//! `"name"` and an `"arguments"` key, since models do not emit a reliable
//! structural delimiter), then counts brace depth from the object's opening
//! brace. The depth counter tracks string and escape state so braces inside
//! string values never miscount.
//!
//! The parse-failure counter increments only when a complete, depth-zero
//! candidate span fails to parse. It must never increment merely because a
//! chunk contains the marker substrings; doing so aborts valid tool calls
//! that happen to stream slowly.

use std::collections::HashSet;

use serde_json::Value;

use super::cache::canonical_params;

// === Types ===

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorState {
    /// Looking for the start of a tool-call payload.
    Scanning,
    /// Inside a candidate JSON object, tracking brace depth.
    Accumulating,
    /// Attempt limit exceeded; the rest of the stream is ignored.
    Aborted,
}

/// How the stream ended, reported by [`ToolCallExtractor::finish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Clean,
    /// Stream ended while accumulating an object. Non-fatal: the model may
    /// have been cut off at a chunk boundary.
    IncompleteObject { pending_bytes: usize },
    /// Extraction gave up after too many parse failures.
    Aborted { parse_failures: u32 },
}

/// A complete tool call recovered from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedToolCall {
    /// Model-supplied `id` when present, else derived from name + canonical
    /// arguments. Used for per-turn dedup.
    pub identity: String,
    pub id: Option<String>,
    pub name: String,
    pub arguments: Value,
}

/// Incremental extractor. Create one per model response; the dedup set is
/// scoped to a single turn.
#[derive(Debug)]
pub struct ToolCallExtractor {
    buffer: String,
    /// Byte offset where scanning resumes; everything before is consumed.
    scan_pos: usize,
    state: ExtractorState,
    /// Opening brace of the current candidate object.
    object_start: usize,
    /// Next unexamined byte while accumulating.
    cursor: usize,
    depth: u32,
    in_string: bool,
    escaped: bool,
    parse_failures: u32,
    max_parse_attempts: u32,
    seen: HashSet<String>,
}

const NAME_MARKER: &str = "\"name\"";
const ARGUMENTS_MARKER: &str = "\"arguments\"";

impl ToolCallExtractor {
    #[must_use]
    pub fn new(max_parse_attempts: u32) -> Self {
        Self {
            buffer: String::new(),
            scan_pos: 0,
            state: ExtractorState::Scanning,
            object_start: 0,
            cursor: 0,
            depth: 0,
            in_string: false,
            escaped: false,
            parse_failures: 0,
            max_parse_attempts: max_parse_attempts.max(1),
            seen: HashSet::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> ExtractorState {
        self.state
    }

    #[must_use]
    pub fn parse_failures(&self) -> u32 {
        self.parse_failures
    }

    /// Prose outside extracted tool-call objects, accumulated so far.
    #[must_use]
    pub fn raw_text(&self) -> &str {
        &self.buffer
    }

    /// Feed the next chunk and return any tool calls completed by it.
    pub fn push_chunk(&mut self, chunk: &str) -> Vec<ExtractedToolCall> {
        if self.state == ExtractorState::Aborted {
            return Vec::new();
        }
        self.buffer.push_str(chunk);

        let mut extracted = Vec::new();
        loop {
            match self.state {
                ExtractorState::Scanning => {
                    if !self.begin_accumulating() {
                        break;
                    }
                }
                ExtractorState::Accumulating => match self.advance_depth_scan() {
                    ScanStep::NeedMoreInput => break,
                    ScanStep::SpanComplete { end } => {
                        if let Some(call) = self.complete_span(end) {
                            extracted.push(call);
                        }
                        if self.state == ExtractorState::Aborted {
                            break;
                        }
                    }
                },
                ExtractorState::Aborted => break,
            }
        }
        extracted
    }

    /// Signal end of stream and report how extraction ended.
    pub fn finish(&mut self) -> StreamOutcome {
        match self.state {
            ExtractorState::Aborted => StreamOutcome::Aborted {
                parse_failures: self.parse_failures,
            },
            ExtractorState::Accumulating => {
                let pending = self.buffer.len().saturating_sub(self.object_start);
                self.state = ExtractorState::Scanning;
                StreamOutcome::IncompleteObject {
                    pending_bytes: pending,
                }
            }
            ExtractorState::Scanning => StreamOutcome::Clean,
        }
    }

    /// Look for marker evidence and an opening brace; on success switch to
    /// accumulation from the object's start.
    fn begin_accumulating(&mut self) -> bool {
        let region = &self.buffer[self.scan_pos..];
        let Some(name_rel) = region.find(NAME_MARKER) else {
            return false;
        };
        if !region.contains(ARGUMENTS_MARKER) {
            return false;
        }
        let first_key_rel = match region.find(ARGUMENTS_MARKER) {
            Some(args_rel) => name_rel.min(args_rel),
            None => name_rel,
        };
        let Some(brace_rel) = region[..first_key_rel].rfind('{') else {
            // Marker text with no enclosing object; skip past it so a later
            // genuine object is still found.
            self.scan_pos += first_key_rel + 1;
            return true;
        };

        self.object_start = self.scan_pos + brace_rel;
        self.cursor = self.object_start;
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
        self.state = ExtractorState::Accumulating;
        true
    }

    /// Advance the brace-depth scan over unexamined bytes.
    fn advance_depth_scan(&mut self) -> ScanStep {
        let bytes = self.buffer.as_bytes();
        while self.cursor < bytes.len() {
            let b = bytes[self.cursor];
            self.cursor += 1;

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }
            match b {
                b'"' => self.in_string = true,
                b'{' => self.depth += 1,
                b'}' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        return ScanStep::SpanComplete { end: self.cursor };
                    }
                }
                _ => {}
            }
        }
        ScanStep::NeedMoreInput
    }

    /// A candidate span closed at depth zero; parse it and either emit a
    /// call or count a failure.
    fn complete_span(&mut self, end: usize) -> Option<ExtractedToolCall> {
        let span = &self.buffer[self.object_start..end];
        match serde_json::from_str::<Value>(span) {
            Ok(value) => {
                self.state = ExtractorState::Scanning;
                self.scan_pos = end;
                self.emit(value)
            }
            Err(err) => {
                // Genuine parse failure of a complete span: the only place
                // the counter may move.
                self.parse_failures += 1;
                tracing::debug!(
                    failures = self.parse_failures,
                    error = %err,
                    "discarding malformed tool-call candidate"
                );
                if self.parse_failures >= self.max_parse_attempts {
                    self.state = ExtractorState::Aborted;
                } else {
                    self.state = ExtractorState::Scanning;
                    self.scan_pos = end;
                }
                None
            }
        }
    }

    fn emit(&mut self, value: Value) -> Option<ExtractedToolCall> {
        let name = value.get("name")?.as_str()?.to_string();
        let arguments = value
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        let identity = match &id {
            Some(id) => id.clone(),
            None => format!("{name}:{}", canonical_params(&arguments)),
        };

        // Overlapping chunk boundaries can echo the same JSON twice; only
        // the first occurrence per turn executes.
        if !self.seen.insert(identity.clone()) {
            tracing::debug!(%name, "skipping duplicate tool call");
            return None;
        }
        Some(ExtractedToolCall {
            identity,
            id,
            name,
            arguments,
        })
    }
}

enum ScanStep {
    NeedMoreInput,
    SpanComplete { end: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn feed(extractor: &mut ToolCallExtractor, chunks: &[&str]) -> Vec<ExtractedToolCall> {
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(extractor.push_chunk(chunk));
        }
        out
    }

    #[test]
    fn whole_object_in_one_chunk() {
        let mut ex = ToolCallExtractor::new(5);
        let calls = ex.push_chunk(r#"{"name":"read_file","arguments":{"path":"a.txt"}}"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].arguments, json!({"path": "a.txt"}));
        assert_eq!(ex.finish(), StreamOutcome::Clean);
    }

    #[test]
    fn object_split_mid_key_across_two_chunks() {
        let mut ex = ToolCallExtractor::new(5);
        let calls = feed(&mut ex, &[r#"{"name":"x","argum"#, r#"ents":{"a":1}}"#]);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "x");
        assert_eq!(calls[0].arguments, json!({"a": 1}));
    }

    #[test]
    fn trailing_prose_is_not_reparsed() {
        let mut ex = ToolCallExtractor::new(5);
        let mut calls = feed(&mut ex, &[r#"{"name":"x","argum"#, r#"ents":{"a":1}}"#]);
        calls.extend(ex.push_chunk(" and now some commentary about the call"));
        assert_eq!(calls.len(), 1);
        assert_eq!(ex.finish(), StreamOutcome::Clean);
    }

    #[test]
    fn byte_at_a_time_split_still_extracts_once() {
        let payload = r#"{"name":"grep","arguments":{"pattern":"fn main"}}"#;
        let mut ex = ToolCallExtractor::new(5);
        let mut calls = Vec::new();
        for ch in payload.chars() {
            calls.extend(ex.push_chunk(&ch.to_string()));
        }
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "grep");
        assert_eq!(ex.parse_failures(), 0);
    }

    #[test]
    fn braces_inside_string_values_do_not_miscount() {
        let payload = r#"{"name":"write_file","arguments":{"content":"fn main() { if x { } }"}}"#;
        let mut ex = ToolCallExtractor::new(5);
        // Split right inside the brace-laden string.
        let (left, right) = payload.split_at(55);
        let calls = feed(&mut ex, &[left, right]);
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].arguments,
            json!({"content": "fn main() { if x { } }"})
        );
    }

    #[test]
    fn escaped_quotes_inside_strings_are_handled() {
        let payload = r#"{"name":"echo","arguments":{"text":"he said \"hi {there}\""}}"#;
        let mut ex = ToolCallExtractor::new(5);
        let calls = feed(&mut ex, &[&payload[..30], &payload[30..]]);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments["text"], json!("he said \"hi {there}\""));
    }

    #[test]
    fn prose_before_and_between_multiple_calls() {
        let mut ex = ToolCallExtractor::new(5);
        let calls = feed(
            &mut ex,
            &[
                r#"Let me look at that. {"name":"a","arguments":{}}"#,
                r#" then I'll run {"name":"b","#,
                r#""arguments":{"n":2}}done."#,
            ],
        );
        let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn counter_stays_zero_for_slowly_streamed_valid_json() {
        // Regression: markers arriving early must not count as failures.
        let payload = r#"{"name":"slow_tool","arguments":{"key":"value","nested":{"x":[1,2,3]}}}"#;
        let mut ex = ToolCallExtractor::new(3);
        let mut calls = Vec::new();
        for chunk in payload.as_bytes().chunks(4) {
            calls.extend(ex.push_chunk(std::str::from_utf8(chunk).unwrap()));
        }
        assert_eq!(ex.parse_failures(), 0);
        assert_eq!(calls.len(), 1);
        assert_ne!(ex.state(), ExtractorState::Aborted);
    }

    #[test]
    fn malformed_span_increments_counter_and_scanning_resumes() {
        let mut ex = ToolCallExtractor::new(5);
        // Complete but invalid JSON (trailing comma), then a valid call.
        let calls = feed(
            &mut ex,
            &[
                r#"{"name":"bad","arguments":{"a":1,},}"#,
                r#" {"name":"good","arguments":{}}"#,
            ],
        );
        assert_eq!(ex.parse_failures(), 1);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "good");
    }

    #[test]
    fn aborts_after_max_parse_failures() {
        let mut ex = ToolCallExtractor::new(2);
        ex.push_chunk(r#"{"name":"a","arguments":{,}}"#);
        assert_eq!(ex.state(), ExtractorState::Scanning);
        ex.push_chunk(r#"{"name":"b","arguments":{,}}"#);
        assert_eq!(ex.state(), ExtractorState::Aborted);
        // Aborted extractors ignore further input, even valid calls.
        let calls = ex.push_chunk(r#"{"name":"c","arguments":{}}"#);
        assert!(calls.is_empty());
        assert_eq!(ex.finish(), StreamOutcome::Aborted { parse_failures: 2 });
    }

    #[test]
    fn stream_end_mid_object_is_incomplete_not_fatal() {
        let mut ex = ToolCallExtractor::new(5);
        ex.push_chunk(r#"{"name":"x","arguments":{"a":"#);
        assert_eq!(ex.state(), ExtractorState::Accumulating);
        let outcome = ex.finish();
        assert!(matches!(outcome, StreamOutcome::IncompleteObject { .. }));
        assert_eq!(ex.parse_failures(), 0);
    }

    #[test]
    fn duplicate_echoed_call_is_discarded() {
        let payload = r#"{"name":"a","arguments":{"k":1}}"#;
        let mut ex = ToolCallExtractor::new(5);
        let calls = feed(&mut ex, &[payload, " ", payload]);
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn key_order_permutation_is_still_a_duplicate() {
        let mut ex = ToolCallExtractor::new(5);
        let calls = feed(
            &mut ex,
            &[
                r#"{"name":"a","arguments":{"x":1,"y":2}}"#,
                r#" {"name":"a","arguments":{"y":2,"x":1}}"#,
            ],
        );
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn distinct_ids_allow_identical_payloads() {
        let mut ex = ToolCallExtractor::new(5);
        let calls = feed(
            &mut ex,
            &[
                r#"{"id":"call_1","name":"a","arguments":{}}"#,
                r#" {"id":"call_2","name":"a","arguments":{}}"#,
            ],
        );
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id.as_deref(), Some("call_1"));
    }

    #[test]
    fn valid_json_without_a_name_is_ignored_silently() {
        let mut ex = ToolCallExtractor::new(5);
        // Marker words appear inside string values only.
        let calls =
            ex.push_chunk(r#"{"note":"mentions \"name\" and \"arguments\" in prose"}"#);
        assert!(calls.is_empty());
        assert_eq!(ex.parse_failures(), 0);
    }

    #[test]
    fn missing_arguments_key_defaults_to_empty_object() {
        // "arguments" appears textually later in the stream; the first
        // object carries none of its own.
        let mut ex = ToolCallExtractor::new(5);
        let calls = ex.push_chunk(r#"{"name":"status"} {"name":"ping","arguments":{}}"#);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "status");
        assert_eq!(calls[0].arguments, json!({}));
    }
}
