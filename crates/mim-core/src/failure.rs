//! Failure taxonomy: the only vocabulary a worker may use to terminate a
//! task non-successfully.
//!
//! Collaborator errors (curl, ffmpeg, the outbound adapter) are classified
//! into these kinds at the call site; the retry policy and quarantine logic
//! never see raw errors.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureClass {
    /// Outbound flood-wait. The wait is honored exactly and never consumes
    /// retry budget.
    #[error("rate limited for {wait_secs}s")]
    RateLimit { wait_secs: u64 },
    /// Hostname lookup failure.
    #[error("dns lookup failed")]
    Dns,
    /// Connection refused/reset/unreachable, send or receive failure.
    #[error("network failure")]
    Network,
    /// No bytes arrived within the inactivity window.
    #[error("transfer stalled")]
    Stall,
    /// Non-2xx HTTP status from a fetch.
    #[error("http status {0}")]
    HttpStatus(u32),
    /// Final size did not match the server-declared content length.
    #[error("incomplete transfer")]
    Incomplete,
    /// Operation stopped by shutdown or an operator cancel.
    #[error("canceled")]
    Canceled,
    /// Encoder exceeded its runtime bound.
    #[error("normalization timed out")]
    NormalizeTimeout,
    /// Content hash or size mismatch after materialization.
    #[error("integrity mismatch")]
    Integrity,
    /// Outbound adapter rejected a media object; the batch is split and the
    /// offender deferred, never retried as-is.
    #[error("media rejected by outbound adapter")]
    MediaInvalid,
    /// Outbound size limit on a photo; retried after recompression.
    #[error("photo over outbound size limit")]
    PhotoTooLarge,
    /// Outbound auth expired; upload stage pauses until re-auth.
    #[error("outbound auth expired")]
    Auth,
    /// Unclassified error; granted one sanity retry before turning permanent.
    #[error("unclassified failure: {0}")]
    Unknown(String),
    /// Terminal. Input preserved under quarantine for operator triage.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl FailureClass {
    /// Whether the owning task may be re-attempted at all.
    pub fn retryable(&self) -> bool {
        match self {
            FailureClass::RateLimit { .. }
            | FailureClass::Dns
            | FailureClass::Network
            | FailureClass::Stall
            | FailureClass::Incomplete
            | FailureClass::Integrity
            | FailureClass::NormalizeTimeout
            | FailureClass::PhotoTooLarge => true,
            FailureClass::HttpStatus(code) => *code == 429 || (500..=599).contains(code),
            FailureClass::Unknown(_) => true,
            // Canceled tasks are requeued by shutdown handling, not retried.
            FailureClass::Canceled => false,
            FailureClass::MediaInvalid | FailureClass::Auth | FailureClass::Permanent(_) => false,
        }
    }

    /// Whether a retry of this class consumes the task's retry budget.
    pub fn consumes_budget(&self) -> bool {
        !matches!(
            self,
            FailureClass::RateLimit { .. } | FailureClass::Auth | FailureClass::Canceled
        )
    }

    /// Whether the payload must be re-fetched from offset zero on retry.
    pub fn restart_from_zero(&self) -> bool {
        matches!(self, FailureClass::Integrity)
    }

    /// Short stable tag persisted in task records and the quarantine index.
    pub fn tag(&self) -> String {
        match self {
            FailureClass::RateLimit { .. } => "rate_limit".into(),
            FailureClass::Dns => "dns".into(),
            FailureClass::Network => "network".into(),
            FailureClass::Stall => "stall".into(),
            FailureClass::HttpStatus(code) => format!("http_{code}"),
            FailureClass::Incomplete => "incomplete".into(),
            FailureClass::Canceled => "canceled".into(),
            FailureClass::NormalizeTimeout => "normalize_timeout".into(),
            FailureClass::Integrity => "integrity".into(),
            FailureClass::MediaInvalid => "media_invalid".into(),
            FailureClass::PhotoTooLarge => "photo_too_large".into(),
            FailureClass::Auth => "auth".into(),
            FailureClass::Unknown(_) => "unknown".into(),
            FailureClass::Permanent(_) => "permanent".into(),
        }
    }
}

/// Classify a curl transfer error.
pub fn classify_curl_error(e: &curl::Error) -> FailureClass {
    if e.is_couldnt_resolve_host() || e.is_couldnt_resolve_proxy() {
        return FailureClass::Dns;
    }
    // Low-speed aborts surface as operation timeouts: the stream produced
    // fewer than the floor bytes/sec over the inactivity window.
    if e.is_operation_timedout() {
        return FailureClass::Stall;
    }
    if e.is_couldnt_connect()
        || e.is_read_error()
        || e.is_recv_error()
        || e.is_send_error()
        || e.is_got_nothing()
    {
        return FailureClass::Network;
    }
    if e.is_partial_file() {
        return FailureClass::Incomplete;
    }
    if e.is_aborted_by_callback() {
        return FailureClass::Canceled;
    }
    FailureClass::Unknown(e.to_string())
}

/// Classify an HTTP status that ended a fetch.
pub fn classify_http_status(code: u32) -> FailureClass {
    FailureClass::HttpStatus(code)
}
