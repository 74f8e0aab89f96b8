//! Relay error types and their user-facing text.

/// Shown when the suite API cannot be reached at all.
pub const CANNOT_REACH_API: &str = "Cannot reach API. Start it: ./start-ai-dev-suite-api.sh";

/// Cap on server-provided detail carried in a rejection message.
pub const MAX_DETAIL_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("API error {status}: {detail}")]
    Rejected { status: u16, detail: String },

    #[error("No response body")]
    NoBody,

    #[error("{message}")]
    Transport { message: String, network: bool },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl RelayError {
    /// Non-success HTTP status; `body` is truncated to [`MAX_DETAIL_CHARS`].
    pub fn rejected(status: u16, body: &str) -> Self {
        RelayError::Rejected {
            status,
            detail: truncate_chars(body, MAX_DETAIL_CHARS),
        }
    }

    /// Failure while sending or reading; classified by keyword when the
    /// caller cannot tell whether it was network-level.
    pub fn transport(message: impl Into<String>) -> Self {
        let message = message.into();
        let network = looks_like_network_failure(&message);
        RelayError::Transport { message, network }
    }

    /// Text delivered to the consumer's error callback.
    pub fn user_message(&self) -> String {
        match self {
            RelayError::Transport { network: true, .. } => CANNOT_REACH_API.to_string(),
            other => other.to_string(),
        }
    }
}

pub fn looks_like_network_failure(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["fetch", "network", "failed", "connect", "sending request"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Truncate on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_message() {
        let err = RelayError::rejected(500, r#"{"error":"boom"}"#);
        assert_eq!(err.user_message(), r#"API error 500: {"error":"boom"}"#);
    }

    #[test]
    fn test_rejection_detail_is_capped() {
        let body = "é".repeat(500);
        let RelayError::Rejected { detail, .. } = RelayError::rejected(502, &body) else {
            panic!("expected rejection");
        };
        assert_eq!(detail.chars().count(), MAX_DETAIL_CHARS);
    }

    #[test]
    fn test_network_failures_use_canned_message() {
        let err = RelayError::transport("error sending request for url (http://localhost:41434)");
        assert_eq!(err.user_message(), CANNOT_REACH_API);

        let err = RelayError::transport("invalid chunk size");
        assert_eq!(err.user_message(), "invalid chunk size");
    }
}
