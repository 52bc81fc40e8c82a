//! Transport classification.
//!
//! Every Engine API request is relayed under exactly one [`TransportMode`].
//! The mode is a pure function of path, query and (for exec start only) body,
//! evaluated against an ordered rule table where the first match wins:
//!
//! | order | rule | mode |
//! |-------|------|------|
//! | 1 | image save, image save-all, container exec, container export | download-stream |
//! | 2 | container attach | interactive-stream |
//! | 3 | events, container logs, build | event-stream |
//! | 4 | exec start body `Detach` flag | download-stream / interactive-stream |
//! | 5 | container stats with `stream` query flag | download-stream |
//! | 6 | anything else | direct |

use std::fmt;

use serde_json::Value;

use crate::request::{PathPattern, decode_query};

/// How a request/response exchange is relayed to the real daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportMode {
    /// Buffered request/response with a JSON body.
    Direct,
    /// Status written immediately, body copied incrementally until EOF.
    DownloadStream,
    /// Long-lived response flushed after every write.
    EventStream,
    /// Hijacked bidirectional raw stream.
    InteractiveStream,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Direct => write!(f, "direct"),
            TransportMode::DownloadStream => write!(f, "download-stream"),
            TransportMode::EventStream => write!(f, "event-stream"),
            TransportMode::InteractiveStream => write!(f, "interactive-stream"),
        }
    }
}

/// Errors from classifying a request.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("cannot decode request body: {0}")]
    Decode(String),

    #[error("missing detach flag in request body")]
    MissingDetach,
}

/// A set of path patterns that select one transport mode.
struct PathRule {
    patterns: &'static [PathPattern],
    mode: TransportMode,
}

const PATH_RULES: &[PathRule] = &[
    PathRule {
        patterns: &[
            PathPattern::new("/images/*/get"),
            PathPattern::new("/images/get"),
            PathPattern::new("/containers/*/exec"),
            PathPattern::new("/containers/*/export"),
        ],
        mode: TransportMode::DownloadStream,
    },
    PathRule {
        patterns: &[PathPattern::new("/containers/*/attach/**")],
        mode: TransportMode::InteractiveStream,
    },
    PathRule {
        patterns: &[
            PathPattern::new("/events"),
            PathPattern::new("/containers/*/logs"),
            PathPattern::new("/build"),
        ],
        mode: TransportMode::EventStream,
    },
];

const EXEC_START: PathPattern = PathPattern::new("/exec/*/start");
const CONTAINER_STATS: PathPattern = PathPattern::new("/containers/*/stats");

/// Body field that decides between detached and attached exec.
const DETACH_FIELD: &str = "Detach";

/// Whether the body must be read before `path` can be classified.
///
/// Exec start is the only operation whose streaming nature is chosen by the
/// client in the body; every other request is forwarded with its body untouched.
pub fn needs_body(path: &str) -> bool {
    EXEC_START.matches(path)
}

/// Classify a request into its transport mode.
///
/// `query` is the raw query string (without `?`). `body` is only consulted for
/// exec start requests; pass an empty slice when the body was not read.
pub fn classify(path: &str, query: &str, body: &[u8]) -> Result<TransportMode, ClassifyError> {
    for rule in PATH_RULES {
        if let Some(pattern) = rule.patterns.iter().find(|p| p.matches(path)) {
            tracing::debug!(path, pattern = pattern.as_str(), mode = %rule.mode, "path rule matched");
            return Ok(rule.mode);
        }
    }

    if !body.is_empty() && needs_body(path) {
        return detach_mode(body);
    }

    if CONTAINER_STATS.matches(path) && streaming_requested(query) {
        return Ok(TransportMode::DownloadStream);
    }

    Ok(TransportMode::Direct)
}

fn detach_mode(body: &[u8]) -> Result<TransportMode, ClassifyError> {
    let fields: serde_json::Map<String, Value> =
        serde_json::from_slice(body).map_err(|e| ClassifyError::Decode(e.to_string()))?;

    match fields.get(DETACH_FIELD) {
        None => Err(ClassifyError::MissingDetach),
        Some(Value::Bool(true)) => Ok(TransportMode::DownloadStream),
        Some(Value::Bool(false)) => Ok(TransportMode::InteractiveStream),
        Some(other) => Err(ClassifyError::Decode(format!(
            "{DETACH_FIELD} must be a boolean, got {other}"
        ))),
    }
}

fn streaming_requested(query: &str) -> bool {
    decode_query(query)
        .iter()
        .any(|(key, value)| key == "stream" && (value == "1" || value == "true"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn mode(path: &str, query: &str, body: &[u8]) -> TransportMode {
        classify(path, query, body).unwrap()
    }

    #[test]
    fn test_download_paths_ignore_body() {
        let junk = b"not json at all";
        for path in [
            "/images/nginx/get",
            "/v1.43/images/library/nginx:latest/get",
            "/images/get",
            "/containers/abc/exec",
            "/v1.41/containers/abc/export",
        ] {
            assert_eq!(mode(path, "", junk), TransportMode::DownloadStream, "{path}");
        }
    }

    #[test]
    fn test_attach_is_interactive() {
        assert_eq!(
            mode("/v1.43/containers/abc/attach", "stream=1&stdin=1", b""),
            TransportMode::InteractiveStream
        );
        assert_eq!(
            mode("/containers/abc/attach/ws", "", b""),
            TransportMode::InteractiveStream
        );
    }

    #[test]
    fn test_event_paths() {
        for path in ["/events", "/v1.43/events", "/containers/abc/logs", "/build"] {
            assert_eq!(mode(path, "", b""), TransportMode::EventStream, "{path}");
        }
    }

    #[test]
    fn test_exec_start_detach_true() {
        assert_eq!(
            mode("/v1.43/exec/e1/start", "", br#"{"Detach":true,"Tty":false}"#),
            TransportMode::DownloadStream
        );
    }

    #[test]
    fn test_exec_start_detach_false() {
        assert_eq!(
            mode("/exec/e1/start", "", br#"{"Detach":false,"Tty":true}"#),
            TransportMode::InteractiveStream
        );
    }

    #[test]
    fn test_exec_start_missing_detach() {
        let err = classify("/exec/e1/start", "", br#"{"Tty":true}"#).unwrap_err();
        assert!(matches!(err, ClassifyError::MissingDetach));
        assert_eq!(err.to_string(), "missing detach flag in request body");
    }

    #[test]
    fn test_exec_start_malformed_body() {
        let err = classify("/exec/e1/start", "", b"{not json").unwrap_err();
        assert!(matches!(err, ClassifyError::Decode(_)));

        let err = classify("/exec/e1/start", "", b"[1,2,3]").unwrap_err();
        assert!(matches!(err, ClassifyError::Decode(_)));
    }

    #[test]
    fn test_exec_start_non_boolean_detach() {
        let err = classify("/exec/e1/start", "", br#"{"Detach":"yes"}"#).unwrap_err();
        assert!(matches!(err, ClassifyError::Decode(_)));
    }

    #[test]
    fn test_exec_start_without_body_is_direct() {
        assert_eq!(mode("/exec/e1/start", "", b""), TransportMode::Direct);
    }

    #[test]
    fn test_body_only_consulted_for_exec_start() {
        assert_eq!(
            mode("/containers/create", "", br#"{"Image":"nginx"}"#),
            TransportMode::Direct
        );
    }

    #[test]
    fn test_stats_streaming_flag() {
        assert_eq!(
            mode("/containers/abc/stats", "stream=1", b""),
            TransportMode::DownloadStream
        );
        assert_eq!(
            mode("/v1.43/containers/abc/stats", "one-shot=false&stream=true", b""),
            TransportMode::DownloadStream
        );
        assert_eq!(
            mode("/containers/abc/stats", "stream=0", b""),
            TransportMode::Direct
        );
        assert_eq!(mode("/containers/abc/stats", "", b""), TransportMode::Direct);
    }

    #[test]
    fn test_stats_streaming_flag_is_percent_decoded() {
        assert_eq!(
            mode("/containers/abc/stats", "str%65am=%74rue", b""),
            TransportMode::DownloadStream
        );
        assert_eq!(
            mode("/containers/abc/stats", "stream=%31", b""),
            TransportMode::DownloadStream
        );
    }

    #[test]
    fn test_default_is_direct() {
        for path in ["/version", "/containers/json", "/images/json", "/_ping", "/"] {
            assert_eq!(mode(path, "", b""), TransportMode::Direct, "{path}");
        }
    }

    #[test]
    fn test_classification_is_idempotent() {
        let body = br#"{"Detach":false}"#;
        let first = mode("/exec/x/start", "", body);
        let second = mode("/exec/x/start", "", body);
        assert_eq!(first, second);
    }

    #[test]
    fn test_needs_body() {
        assert!(needs_body("/v1.43/exec/abc/start"));
        assert!(!needs_body("/containers/create"));
        assert!(!needs_body("/exec/abc/resize"));
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(TransportMode::InteractiveStream.to_string(), "interactive-stream");
        assert_eq!(TransportMode::Direct.to_string(), "direct");
    }
}
