use serde::{Deserialize, Serialize};

/// An inbound control frame: `{"action":"auth"|"subscribe"|"unsubscribe",...}`.
/// `params` is the raw comma-joined selector string; callers run it through
/// `crate::selector::parse_selectors`. `since` is only meaningful on a
/// `subscribe` action against a millisecond-bar selector.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ControlRequest {
    pub action: ControlAction,
    #[serde(default)]
    pub params: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub since: Option<i64>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Auth,
    Subscribe,
    Unsubscribe,
}

/// One element of the `[{"ev":"status",...}]` response array Polygon-style
/// clients expect after every control frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusMessage {
    pub ev: StatusEv,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StatusEv {
    #[serde(rename = "status")]
    Status,
}

/// A status frame is always wire-serialized as a single-element JSON array,
/// matching every other batch of events this stack emits.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusFrame(pub Vec<StatusMessage>);

impl StatusFrame {
    fn one(status: impl Into<String>, message: impl Into<String>) -> Self {
        StatusFrame(vec![StatusMessage {
            ev: StatusEv::Status,
            status: status.into(),
            message: message.into(),
        }])
    }

    pub fn connected() -> Self {
        Self::one("connected", "Connected")
    }

    pub fn auth_success() -> Self {
        Self::one("auth_success", "authenticated")
    }

    pub fn auth_failed(reason: impl Into<String>) -> Self {
        Self::one("auth_failed", reason.into())
    }

    pub fn subscribed(selectors: impl Into<String>) -> Self {
        Self::one("success", format!("subscribed to: {}", selectors.into()))
    }

    pub fn unsubscribed(selectors: impl Into<String>) -> Self {
        Self::one("success", format!("unsubscribed from: {}", selectors.into()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::one("error", message.into())
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "[]".to_string())
    }
}

impl ControlRequest {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Split `params` on commas, trimming blanks. Returns an empty vec for
    /// a missing or empty `params` field rather than erroring — an auth
    /// frame legitimately carries no `params` at all.
    pub fn selector_strings(&self) -> Vec<&str> {
        self.params
            .as_deref()
            .map(|p| p.split(',').map(str::trim).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_auth_frame() {
        let req = ControlRequest::parse(r#"{"action":"auth","params":"secret-token"}"#).unwrap();
        assert_eq!(req.action, ControlAction::Auth);
        assert_eq!(req.params.as_deref(), Some("secret-token"));
    }

    #[test]
    fn parses_subscribe_with_since() {
        let req = ControlRequest::parse(
            r#"{"action":"subscribe","params":"500Ms.TSLA","since":1700000000000}"#,
        )
        .unwrap();
        assert_eq!(req.action, ControlAction::Subscribe);
        assert_eq!(req.since, Some(1_700_000_000_000));
    }

    #[test]
    fn selector_strings_splits_and_trims() {
        let req = ControlRequest::parse(r#"{"action":"subscribe","params":"T.AAPL, Q.MSFT"}"#)
            .unwrap();
        assert_eq!(req.selector_strings(), vec!["T.AAPL", "Q.MSFT"]);
    }

    #[test]
    fn status_frame_serializes_as_array() {
        let frame = StatusFrame::auth_success();
        let json = frame.to_json();
        assert!(json.starts_with('['));
        assert!(json.contains("auth_success"));
    }
}
