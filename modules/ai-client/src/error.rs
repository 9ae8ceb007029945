//! Error classification for AI provider calls.
//!
//! Providers surface failures as HTTP status lines and freeform error
//! bodies. The retry machinery upstream needs to know only three things:
//! is this a rate limit, is it transient, or is it fatal.

/// How a failed provider call should be handled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiErrorKind {
    /// Provider rejected the call for quota/throughput reasons. Switching
    /// to another model is usually faster than waiting out the window.
    RateLimited,
    /// Network blip or 5xx. Worth retrying the same model after a delay.
    Transient,
    /// Anything else: bad request, auth failure, schema mismatch.
    Fatal,
}

const RATE_LIMIT_MARKERS: &[&str] = &[
    "429",
    "too_many_requests",
    "rate limit",
    "rate_limit_error",
    "resource_exhausted",
    "quota exceeded",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "enotfound",
    "econnreset",
    "etimedout",
    "eai_again",
    "connection reset",
    "connection refused",
    "timed out",
    "error sending request",
];

/// Classify an error from a provider call by inspecting its display chain.
pub fn classify_error(err: &anyhow::Error) -> AiErrorKind {
    let text = format!("{err:#}").to_lowercase();

    if RATE_LIMIT_MARKERS.iter().any(|m| text.contains(m)) {
        return AiErrorKind::RateLimited;
    }

    if TRANSIENT_MARKERS.iter().any(|m| text.contains(m)) {
        return AiErrorKind::Transient;
    }

    // Provider error messages embed the HTTP status, e.g. "(503 Service Unavailable)"
    if contains_server_error_status(&text) {
        return AiErrorKind::Transient;
    }

    AiErrorKind::Fatal
}

fn contains_server_error_status(text: &str) -> bool {
    text.as_bytes().windows(4).any(|w| {
        w[0] == b'(' && w[1] == b'5' && w[2].is_ascii_digit() && w[3].is_ascii_digit()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn rate_limit_phrases_classify_as_rate_limited() {
        for msg in [
            "OpenAI API error (429 Too Many Requests): slow down",
            "Claude API error (400): rate_limit_error",
            "resource_exhausted: quota exceeded for model",
        ] {
            assert_eq!(classify_error(&anyhow!("{msg}")), AiErrorKind::RateLimited);
        }
    }

    #[test]
    fn network_failures_classify_as_transient() {
        assert_eq!(
            classify_error(&anyhow!("getaddrinfo ENOTFOUND api.openai.com")),
            AiErrorKind::Transient
        );
        assert_eq!(
            classify_error(&anyhow!("socket hang up: ECONNRESET")),
            AiErrorKind::Transient
        );
    }

    #[test]
    fn server_errors_classify_as_transient() {
        assert_eq!(
            classify_error(&anyhow!("OpenAI API error (503 Service Unavailable): upstream")),
            AiErrorKind::Transient
        );
    }

    #[test]
    fn everything_else_is_fatal() {
        assert_eq!(
            classify_error(&anyhow!("Claude API error (401 Unauthorized): bad key")),
            AiErrorKind::Fatal
        );
        assert_eq!(
            classify_error(&anyhow!("Failed to deserialize response")),
            AiErrorKind::Fatal
        );
    }
}
