use std::collections::HashMap;
use std::sync::LazyLock;

use handover_process::ProcessRole;
use regex::Regex;

use crate::supervisor::LogSource;

/// Structured-field form the agent logs once its session exists, e.g.
/// `{'conversation_url': 'https://...'}`. The only value source.
static ENDPOINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"['"]conversation_url['"]\s*:\s*['"]([^'"]+)['"]"#).expect("endpoint pattern")
});

/// Human-readable confirmation that the agent joined its session. May appear
/// without the endpoint value, so it never produces one.
const AGENT_JOINED_MARKER: &str = "Joined https://";

/// Readiness line printed by the UI dev server once it accepts connections.
const UI_READY_MARKER: &str = "Local:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanHit {
    Endpoint(String),
    AgentJoined,
    UiReady,
}

/// Incremental scanner over child output. Buffers incomplete lines per
/// (role, stream) and matches each completed line against the extraction
/// patterns. All guards are once-per-cycle: the first endpoint match wins no
/// matter which stream it arrived on, and later matches are ignored until
/// `reset`.
#[derive(Debug, Default)]
pub struct LogScanner {
    captured: Option<String>,
    agent_joined: bool,
    ui_ready: bool,
    partial: HashMap<(ProcessRole, LogSource), String>,
}

impl LogScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-arm all guards for a new pipeline cycle.
    pub fn reset(&mut self) {
        self.captured = None;
        self.agent_joined = false;
        self.ui_ready = false;
        self.partial.clear();
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.captured.as_deref()
    }

    /// Feed a raw output chunk. A non-matching line is not an error; it
    /// simply produces no hit.
    pub fn feed(&mut self, role: ProcessRole, source: LogSource, chunk: &str) -> Vec<ScanHit> {
        let buf = self.partial.entry((role, source)).or_default();
        buf.push_str(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = buf.find('\n') {
            let line: String = buf.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }

        let mut hits = Vec::new();
        for line in &lines {
            if let Some(hit) = self.scan_line(role, line) {
                hits.push(hit);
            }
        }
        hits
    }

    fn scan_line(&mut self, role: ProcessRole, line: &str) -> Option<ScanHit> {
        match role {
            ProcessRole::Agent => {
                if self.captured.is_none()
                    && let Some(caps) = ENDPOINT_RE.captures(line)
                {
                    let endpoint = caps[1].to_string();
                    self.captured = Some(endpoint.clone());
                    return Some(ScanHit::Endpoint(endpoint));
                }
                if !self.agent_joined && line.contains(AGENT_JOINED_MARKER) {
                    self.agent_joined = true;
                    return Some(ScanHit::AgentJoined);
                }
                None
            }
            ProcessRole::Ui => {
                if !self.ui_ready && line.contains(UI_READY_MARKER) {
                    self.ui_ready = true;
                    return Some(ScanHit::UiReady);
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL_LINE: &str = "DEBUG {'conversation_url': 'https://example/abc', 'id': '42'}\n";

    fn feed_agent(s: &mut LogScanner, source: LogSource, chunk: &str) -> Vec<ScanHit> {
        s.feed(ProcessRole::Agent, source, chunk)
    }

    #[test]
    fn extracts_endpoint_from_structured_line() {
        let mut s = LogScanner::new();
        let hits = feed_agent(&mut s, LogSource::Stdout, URL_LINE);
        assert_eq!(
            hits,
            vec![ScanHit::Endpoint("https://example/abc".to_string())]
        );
        assert_eq!(s.endpoint(), Some("https://example/abc"));
    }

    #[test]
    fn extracts_endpoint_with_double_quotes() {
        let mut s = LogScanner::new();
        let hits = feed_agent(
            &mut s,
            LogSource::Stderr,
            "{\"conversation_url\": \"https://example/xyz\"}\n",
        );
        assert_eq!(
            hits,
            vec![ScanHit::Endpoint("https://example/xyz".to_string())]
        );
    }

    #[test]
    fn capture_is_idempotent_within_a_cycle() {
        let mut s = LogScanner::new();
        assert_eq!(feed_agent(&mut s, LogSource::Stdout, URL_LINE).len(), 1);
        // Duplicate on the same stream.
        assert!(feed_agent(&mut s, LogSource::Stdout, URL_LINE).is_empty());
        // Duplicate on the other stream, with a different value: still ignored.
        assert!(
            feed_agent(
                &mut s,
                LogSource::Stderr,
                "{'conversation_url': 'https://example/other'}\n"
            )
            .is_empty()
        );
        assert_eq!(s.endpoint(), Some("https://example/abc"));
    }

    #[test]
    fn reset_rearms_capture() {
        let mut s = LogScanner::new();
        feed_agent(&mut s, LogSource::Stdout, URL_LINE);
        s.reset();
        assert_eq!(s.endpoint(), None);
        assert_eq!(feed_agent(&mut s, LogSource::Stderr, URL_LINE).len(), 1);
    }

    #[test]
    fn buffers_lines_split_across_chunks() {
        let mut s = LogScanner::new();
        assert!(
            feed_agent(&mut s, LogSource::Stdout, "{'conversation_url': 'https://exam").is_empty()
        );
        let hits = feed_agent(&mut s, LogSource::Stdout, "ple/abc'}\nmore\n");
        assert_eq!(
            hits,
            vec![ScanHit::Endpoint("https://example/abc".to_string())]
        );
    }

    #[test]
    fn streams_buffer_independently() {
        let mut s = LogScanner::new();
        // A partial line on stderr must not be completed by stdout data.
        assert!(feed_agent(&mut s, LogSource::Stderr, "{'conversation_url':").is_empty());
        assert!(feed_agent(&mut s, LogSource::Stdout, " 'https://example/abc'}\n").is_empty());
        let hits = feed_agent(&mut s, LogSource::Stderr, " 'https://example/abc'}\n");
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn joined_phrase_is_confirmation_only() {
        let mut s = LogScanner::new();
        let hits = feed_agent(&mut s, LogSource::Stdout, "Joined https://example/room\n");
        assert_eq!(hits, vec![ScanHit::AgentJoined]);
        // The phrase never supplies the value.
        assert_eq!(s.endpoint(), None);
        // And it only fires once.
        assert!(feed_agent(&mut s, LogSource::Stdout, "Joined https://example/room\n").is_empty());
    }

    #[test]
    fn nonmatching_lines_produce_nothing() {
        let mut s = LogScanner::new();
        assert!(feed_agent(&mut s, LogSource::Stdout, "starting pipeline\nok\n").is_empty());
    }

    #[test]
    fn ui_readiness_marker_fires_once() {
        let mut s = LogScanner::new();
        let hits = s.feed(
            ProcessRole::Ui,
            LogSource::Stdout,
            "  Local:   http://localhost:3000/\n",
        );
        assert_eq!(hits, vec![ScanHit::UiReady]);
        assert!(
            s.feed(ProcessRole::Ui, LogSource::Stdout, "Local: again\n")
                .is_empty()
        );
    }

    #[test]
    fn ui_lines_never_yield_endpoints() {
        let mut s = LogScanner::new();
        assert!(s.feed(ProcessRole::Ui, LogSource::Stdout, URL_LINE).is_empty());
        assert_eq!(s.endpoint(), None);
    }
}
