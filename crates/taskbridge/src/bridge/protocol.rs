//! Wire protocol between the dispatcher (parent) and the worker subprocess.
//!
//! One record per line, fields separated by `|`:
//! - parent → worker: `<id>|<payload>`
//! - worker → parent: `<id>|<kind>|<payload...>` where kind is `READY` or `RESULT`
//!
//! Anything else the worker prints is a diagnostic line and is only logged.

use serde::{Deserialize, Serialize};

/// Field separator. Never appears in ids or kinds; payloads may contain it.
pub const FIELD_DELIMITER: char = '|';

/// Identifier linking a dispatched request to its response.
///
/// UUID v4 (122 random bits) rendered as 32 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(uuid::Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    /// Parse an id as echoed back by the worker. Returns `None` for anything
    /// this dispatcher could not have issued, including other renderings of
    /// the same UUID (hyphenated, braced, urn, uppercase).
    pub fn parse(s: &str) -> Option<Self> {
        let uuid = uuid::Uuid::try_parse(s).ok()?;
        let id = Self(uuid);
        (id.to_string() == s).then_some(id)
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Kind field of a worker → parent record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Ready,
    Result,
}

impl MessageKind {
    /// Case-insensitive. `response` is the legacy spelling of `RESULT`.
    pub fn parse(kind: &str) -> Option<Self> {
        if kind.eq_ignore_ascii_case("ready") {
            Some(Self::Ready)
        } else if kind.eq_ignore_ascii_case("result") || kind.eq_ignore_ascii_case("response") {
            Some(Self::Result)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Result => "RESULT",
        }
    }
}

/// A request record, parent → worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: CorrelationId,
    pub payload: String,
}

impl Request {
    pub fn new(id: CorrelationId, payload: impl Into<String>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }

    /// Render as a single newline-terminated record.
    pub fn to_line(&self) -> String {
        format!("{}{}{}\n", self.id, FIELD_DELIMITER, self.payload)
    }
}

/// A decoded record, worker → parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMessage {
    /// Readiness handshake. Emitted once per worker start.
    Ready,
    /// Result for a pending request. `id` is kept raw; an id that does not
    /// parse can never match a pending request.
    Result { id: String, payload: String },
    /// Free-text output. Logged, never correlated.
    Diagnostic(String),
    /// A line over the codec's length limit was discarded.
    Oversized,
}

/// Decode one received line (without its terminator).
///
/// Returns `None` for blank lines.
pub fn parse_line(line: &str) -> Option<WorkerMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let mut fields = line.splitn(3, FIELD_DELIMITER);
    let id = fields.next().unwrap_or_default();
    let Some(kind) = fields.next().and_then(MessageKind::parse) else {
        return Some(WorkerMessage::Diagnostic(line.to_string()));
    };
    let payload = fields.next().unwrap_or_default();

    Some(match kind {
        MessageKind::Ready => WorkerMessage::Ready,
        MessageKind::Result => WorkerMessage::Result {
            id: id.to_string(),
            payload: payload.to_string(),
        },
    })
}

/// A payload must fit on one line.
pub fn validate_payload(payload: &str) -> Result<(), String> {
    if payload.contains(['\n', '\r']) {
        return Err("payload contains a line break".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_id_is_32_hex_chars() {
        let id = CorrelationId::new();
        let s = id.to_string();
        assert_eq!(s.len(), 32);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(CorrelationId::parse(&s), Some(id));
    }

    #[test]
    fn correlation_id_rejects_foreign_tokens() {
        assert_eq!(CorrelationId::parse("abc123"), None);
        assert_eq!(CorrelationId::parse(""), None);
    }

    #[test]
    fn correlation_id_only_matches_simple_form() {
        let id = CorrelationId::new();
        let uuid = id.as_uuid();

        assert_eq!(CorrelationId::parse(&uuid.hyphenated().to_string()), None);
        assert_eq!(CorrelationId::parse(&uuid.braced().to_string()), None);
        assert_eq!(CorrelationId::parse(&uuid.urn().to_string()), None);
        assert_eq!(CorrelationId::parse(&id.to_string().to_uppercase()), None);
        assert_eq!(CorrelationId::parse(&uuid.simple().to_string()), Some(id));
    }

    #[test]
    fn request_line_format() {
        let id = CorrelationId::new();
        let req = Request::new(id, r#"{"x":1}"#);
        assert_eq!(req.to_line(), format!("{id}|{{\"x\":1}}\n"));
    }

    #[test]
    fn parse_ready_ignores_id_and_payload() {
        assert_eq!(parse_line("0|READY|"), Some(WorkerMessage::Ready));
        assert_eq!(parse_line("0|ready|"), Some(WorkerMessage::Ready));
        assert_eq!(parse_line("whatever|Ready"), Some(WorkerMessage::Ready));
    }

    #[test]
    fn parse_result_keeps_delimiters_in_payload() {
        assert_eq!(
            parse_line(r#"abc123|RESULT|{"result":"a|b"}"#),
            Some(WorkerMessage::Result {
                id: "abc123".to_string(),
                payload: r#"{"result":"a|b"}"#.to_string(),
            })
        );
    }

    #[test]
    fn parse_result_accepts_legacy_response_kind() {
        assert_eq!(
            parse_line("id1|response|pong|data\n"),
            Some(WorkerMessage::Result {
                id: "id1".to_string(),
                payload: "pong|data".to_string(),
            })
        );
    }

    #[test]
    fn parse_result_without_payload() {
        assert_eq!(
            parse_line("id1|RESULT"),
            Some(WorkerMessage::Result {
                id: "id1".to_string(),
                payload: String::new(),
            })
        );
    }

    #[test]
    fn parse_unknown_kind_is_diagnostic() {
        assert_eq!(
            parse_line("id1|PROGRESS|50%"),
            Some(WorkerMessage::Diagnostic("id1|PROGRESS|50%".to_string()))
        );
        assert_eq!(
            parse_line("loading model weights"),
            Some(WorkerMessage::Diagnostic("loading model weights".to_string()))
        );
    }

    #[test]
    fn parse_blank_line() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("   \r"), None);
    }

    #[test]
    fn payload_validation() {
        assert!(validate_payload(r#"{"a":"b|c"}"#).is_ok());
        assert!(validate_payload("two\nlines").is_err());
        assert!(validate_payload("carriage\rreturn").is_err());
    }
}
