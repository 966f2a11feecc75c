//! Fault classification
//!
//! Every collaborator (primary classifier, worker, data source) fails with a
//! [`Fault`]. The orchestration layer never branches on the raw fault; it asks
//! [`classify`] for a stable [`ErrorCategory`] plus a recoverable flag and
//! decides from that whether the failure counts against the health tracker.
//!
//! Classification is type based first (the `Fault` variant, then any
//! `std::io::Error` in an `anyhow` chain) and falls back to message patterns.
//! It never panics and never fails.

use std::fmt;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Longest reason string surfaced to callers.
const MAX_REASON_LEN: usize = 160;

// ============================================================================
// Categories
// ============================================================================

/// Stable failure category shown to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Connection refused, reset, DNS and similar transport failures
    Network,

    /// A deadline elapsed before the collaborator answered
    Timeout,

    /// The upstream service answered with an error
    UpstreamApi,

    /// The request itself was rejected as invalid
    Validation,

    /// A bug or invariant violation inside a collaborator
    Internal,

    /// Nothing more specific could be determined
    Unknown,
}

impl ErrorCategory {
    /// Snake-case label, identical to the serialized form
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::UpstreamApi => "upstream_api",
            Self::Validation => "validation",
            Self::Internal => "internal",
            Self::Unknown => "unknown",
        }
    }

    /// Whether a retry (or another attempt later) may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::UpstreamApi | Self::Unknown
        )
    }

    /// Short reason suitable for an end user
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Network => "a backend could not be reached",
            Self::Timeout => "a backend took too long to answer",
            Self::UpstreamApi => "an upstream service is temporarily unavailable",
            Self::Validation => "the request could not be understood",
            Self::Internal => "a backend failed while handling the request",
            Self::Unknown => "an unexpected error occurred",
        }
    }

    /// Operator-facing hint
    pub fn suggested_action(&self) -> &'static str {
        match self {
            Self::Network => "check connectivity and retry",
            Self::Timeout => "retry later or raise the task timeout",
            Self::UpstreamApi => "fail over to a backup data source",
            Self::Validation => "check the input format",
            Self::Internal => "inspect worker logs",
            Self::Unknown => "retry the operation",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Faults
// ============================================================================

/// Failure returned by a collaborator
#[derive(Debug, thiserror::Error)]
pub enum Fault {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("upstream error (status {status:?}): {message}")]
    Upstream {
        status: Option<u16>,
        message: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Fault {
    /// Shorthand for an upstream failure without a status code
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            status: None,
            message: message.into(),
        }
    }
}

/// Result of classifying a [`Fault`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub category: ErrorCategory,
    pub recoverable: bool,
}

impl Classification {
    fn of(category: ErrorCategory) -> Self {
        Self {
            category,
            recoverable: category.is_recoverable(),
        }
    }
}

/// Map a fault to its category and recoverability.
pub fn classify(fault: &Fault) -> Classification {
    match fault {
        Fault::Timeout(_) => Classification::of(ErrorCategory::Timeout),
        Fault::Connection(_) => Classification::of(ErrorCategory::Network),
        Fault::Upstream { status, .. } => classify_status(*status),
        Fault::InvalidInput(_) => Classification::of(ErrorCategory::Validation),
        Fault::Internal(_) => Classification::of(ErrorCategory::Internal),
        Fault::Other(err) => {
            let from_io = err
                .chain()
                .find_map(|cause| cause.downcast_ref::<io::Error>())
                .and_then(classify_io);

            let from_elapsed = err
                .chain()
                .any(|cause| cause.is::<tokio::time::error::Elapsed>())
                .then_some(ErrorCategory::Timeout);

            let category = from_io
                .or(from_elapsed)
                .unwrap_or_else(|| classify_message(&format!("{err:#}")));

            Classification::of(category)
        }
    }
}

fn classify_status(status: Option<u16>) -> Classification {
    match status {
        Some(408) => Classification::of(ErrorCategory::Timeout),
        // Client errors other than throttling will not improve on retry.
        Some(code) if (400..500).contains(&code) && code != 429 => Classification {
            category: ErrorCategory::UpstreamApi,
            recoverable: false,
        },
        _ => Classification::of(ErrorCategory::UpstreamApi),
    }
}

fn classify_io(err: &io::Error) -> Option<ErrorCategory> {
    use io::ErrorKind::*;

    match err.kind() {
        TimedOut => Some(ErrorCategory::Timeout),
        ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected
        | AddrNotAvailable | BrokenPipe => Some(ErrorCategory::Network),
        InvalidInput | InvalidData => Some(ErrorCategory::Validation),
        _ => None,
    }
}

fn classify_message(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["timeout", "timed out", "deadline"]) {
        ErrorCategory::Timeout
    } else if has(&["connection", "network", "dns", "unreachable", "refused"]) {
        ErrorCategory::Network
    } else if has(&["api", "http", "status", "upstream", "rate limit"]) {
        ErrorCategory::UpstreamApi
    } else if has(&["validation", "invalid", "malformed", "missing parameter"]) {
        ErrorCategory::Validation
    } else if has(&["internal", "panic", "bug"]) {
        ErrorCategory::Internal
    } else {
        ErrorCategory::Unknown
    }
}

// ============================================================================
// User-visible detail
// ============================================================================

/// Category plus short reason carried by every failed result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub category: ErrorCategory,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: truncate(message.into()),
        }
    }

    /// Build the caller-facing detail for a fault.
    ///
    /// Internal and unknown faults are replaced by the category's stock
    /// message so raw internals never leak into a response.
    pub fn from_fault(fault: &Fault) -> Self {
        let category = classify(fault).category;
        let message = match category {
            ErrorCategory::Internal | ErrorCategory::Unknown => {
                category.user_message().to_string()
            }
            _ => fault.to_string(),
        };
        Self::new(category, message)
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

fn truncate(mut message: String) -> String {
    if message.len() > MAX_REASON_LEN {
        let mut cut = MAX_REASON_LEN;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
        message.push('…');
    }
    message
}
