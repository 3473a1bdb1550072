// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tundra-core.
//!
//! Replay and store errors are fatal by design: once the in-memory state
//! can no longer be proven to match the durable log, the process must stop
//! rather than risk divergence. Domain validation failures never reach this
//! type; they are reported as structured `false` results at the control
//! boundary without touching the log.

use thiserror::Error;

/// Result type using CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Fatal errors of the store and replay machinery.
#[derive(Debug, Error)]
pub enum CoreError {
    /// I/O failure on the event log or the content store.
    #[error("store I/O error during {operation}: {source}")]
    Store {
        /// The store operation that failed.
        operation: &'static str,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An event log line that cannot be parsed back into a record.
    #[error("malformed event record at line {line}: {reason}")]
    Record {
        /// 1-based line number in the event log.
        line: usize,
        /// What was wrong with the line.
        reason: String,
    },

    /// An event name absent from the replay table. The store refuses to
    /// guess what such an event would have done.
    #[error("cannot replay event \"{0}\": no such event")]
    UnknownEvent(String),

    /// A structurally recognized event whose fields do not decode.
    #[error("event {name}: {reason}")]
    Malformed {
        /// Event name.
        name: String,
        /// What was wrong with the fields.
        reason: String,
    },

    /// Replayed history contradicts the in-memory state (dense-id or
    /// missing-target assertion).
    #[error("replay inconsistency: {0}")]
    Inconsistent(String),

    /// A content read outside the bounds of the binary store.
    #[error("content range {offset}+{length} exceeds store size {size}")]
    RangeOutOfBounds {
        /// Requested start offset.
        offset: u64,
        /// Requested length.
        length: u64,
        /// Current store size.
        size: u64,
    },
}

impl CoreError {
    pub(crate) fn store(operation: &'static str, source: std::io::Error) -> Self {
        CoreError::Store { operation, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::UnknownEvent("problem.rename".to_string());
        assert_eq!(
            err.to_string(),
            "cannot replay event \"problem.rename\": no such event"
        );

        let err = CoreError::Record {
            line: 17,
            reason: "missing timestamp".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "malformed event record at line 17: missing timestamp"
        );

        let err = CoreError::RangeOutOfBounds {
            offset: 100,
            length: 50,
            size: 120,
        };
        assert_eq!(err.to_string(), "content range 100+50 exceeds store size 120");
    }

    #[test]
    fn test_store_error_keeps_source() {
        let err = CoreError::store(
            "append",
            std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        );
        assert!(err.to_string().contains("append"));
        assert!(err.to_string().contains("disk full"));
    }
}
