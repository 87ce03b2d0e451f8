//! Failure classification for per-URL errors
//!
//! Classes are checked in order and the first match wins: a dead browser
//! outranks everything (the session is the casualty, not the URL), a
//! missing scraper is terminal, network noise is retryable, anything else
//! is permanent for the URL.

use std::time::Duration;

/// What went wrong with one unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The browser, page, or CDP session died under us. The session is
    /// invalidated and the URL is left untouched for the next batch.
    BrowserClosed,
    /// No extractor can handle this site. Terminal, never retried.
    MissingExtractor,
    /// Transient transport failure. Retried with backoff; on final failure
    /// the target is marked failed and a datacenter proxy gets blocked.
    Network,
    /// Anything else. Terminal for the URL, no proxy penalty.
    Other,
}

const BROWSER_CLOSED_PATTERNS: &[&str] = &[
    "has been closed",
    "browser disconnected",
    "session not found",
    "session expired",
    "session closed",
    "websocket",
    "execution context was destroyed",
];

const MISSING_EXTRACTOR_PATTERNS: &[&str] = &[
    "failed to load scraper",
    "no scraper registered",
    "cannot find module",
];

const NETWORK_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "network",
    "connection",
    "navigation",
    "err_aborted",
    "frame was detached",
];

impl FailureClass {
    /// Classify an error by message pattern, first match wins
    #[must_use]
    pub fn classify(error: &anyhow::Error) -> Self {
        // {:#} keeps the context chain; a wrapped CDP error often carries
        // the interesting text below the top level.
        let msg = format!("{error:#}").to_lowercase();

        if BROWSER_CLOSED_PATTERNS.iter().any(|p| msg.contains(p)) {
            return Self::BrowserClosed;
        }
        if MISSING_EXTRACTOR_PATTERNS.iter().any(|p| msg.contains(p)) {
            return Self::MissingExtractor;
        }
        if NETWORK_PATTERNS.iter().any(|p| msg.contains(p)) {
            return Self::Network;
        }
        Self::Other
    }

    /// Whether another in-batch attempt makes sense
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network)
    }
}

/// Backoff before retry `attempt` (zero-based): 2s, 4s, 6s, ...
#[must_use]
pub fn retry_backoff(attempt: u32) -> Duration {
    Duration::from_secs(2) * (attempt + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(msg: &str) -> FailureClass {
        FailureClass::classify(&anyhow::anyhow!("{msg}"))
    }

    #[test]
    fn browser_death_wins_over_network_words() {
        assert_eq!(
            classify("Navigation failed: browser disconnected"),
            FailureClass::BrowserClosed
        );
        assert_eq!(classify("Target has been closed"), FailureClass::BrowserClosed);
        assert_eq!(
            classify("Execution context was destroyed"),
            FailureClass::BrowserClosed
        );
        assert_eq!(classify("WebSocket protocol error"), FailureClass::BrowserClosed);
    }

    #[test]
    fn missing_scraper_is_terminal_class() {
        assert_eq!(
            classify("failed to load scraper 'shop.example'"),
            FailureClass::MissingExtractor
        );
        assert_eq!(classify("Cannot find module './x'"), FailureClass::MissingExtractor);
        assert!(!FailureClass::MissingExtractor.is_retryable());
    }

    #[test]
    fn network_errors_are_retryable() {
        for msg in [
            "page load timed out after 15s",
            "net::ERR_ABORTED",
            "connection reset by peer",
            "Navigation timeout exceeded",
            "frame was detached",
        ] {
            assert_eq!(classify(msg), FailureClass::Network, "{msg}");
        }
        assert!(FailureClass::Network.is_retryable());
    }

    #[test]
    fn unknown_errors_are_permanent() {
        assert_eq!(classify("selector returned nothing"), FailureClass::Other);
        assert!(!FailureClass::Other.is_retryable());
    }

    #[test]
    fn backoff_grows_linearly() {
        assert_eq!(retry_backoff(0), Duration::from_secs(2));
        assert_eq!(retry_backoff(1), Duration::from_secs(4));
        assert_eq!(retry_backoff(2), Duration::from_secs(6));
    }
}
