// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Judge-channel message vocabulary on top of raw packets.
//!
//! Field keys, verdict statuses, the file-transfer field encoding, and the
//! `FREQ` cache-negotiation list. Request/response semantics live in the
//! core's worker session; this module only deals in bytes.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

/// Well-known packet field keys.
pub mod field {
    /// Correlation id tagging a request and its response.
    pub const ID: &[u8] = b"ID";
    /// Request verb: `compile` or `test`.
    pub const COMMAND: &[u8] = b"Command";
    /// Rendered compiler invocation line.
    pub const COMPILER: &[u8] = b"Compiler";
    /// Worker-visible name for the produced binary.
    pub const BINARY: &[u8] = b"Binary";
    /// Source file being compiled (file field).
    pub const SOURCE: &[u8] = b"Source";
    /// Response status; a verdict or `FREQ`.
    pub const STATUS: &[u8] = b"Status";
    /// Compiled executable (file field).
    pub const EXE_FILE: &[u8] = b"ExeFile";
    /// Compiler / checker diagnostic output.
    pub const UTILITY_OUTPUT: &[u8] = b"UtilityOutput";
    /// Rendered run command for interpreted solutions.
    pub const RUN: &[u8] = b"Run";
    /// Test input data (file field).
    pub const TEST_PATH: &[u8] = b"TestPath";
    /// Expected answer data (file field).
    pub const ANSWER_PATH: &[u8] = b"AnswerPath";
    /// Input stream name presented to the solution.
    pub const INPUT_FILE: &[u8] = b"InputFile";
    /// Output stream name collected from the solution.
    pub const OUTPUT_FILE: &[u8] = b"OutputFile";
    /// Time limit in milliseconds.
    pub const TIME_LIMIT: &[u8] = b"TimeLimit";
    /// Memory limit in bytes.
    pub const MEMORY_LIMIT: &[u8] = b"MemoryLimit";
    /// Checker executable (file field).
    pub const CHECKER: &[u8] = b"Checker";
    /// Rendered run command for an interpreted checker.
    pub const CHECKER_RUN: &[u8] = b"CheckerRun";
    /// Peak run time reported by the worker, in microseconds.
    pub const TIME: &[u8] = b"Time";
    /// Peak memory reported by the worker, in bytes.
    pub const MEMORY: &[u8] = b"Memory";
    /// Worker name, sent on registration.
    pub const NAME: &[u8] = b"Name";
    /// Worker password, sent on registration.
    pub const PASSWORD: &[u8] = b"Password";
    /// `FREQ` payload: the files the worker is missing.
    pub const FILES: &[u8] = b"Files";
}

/// `Status` value asking for missing files instead of answering the call.
pub const STATUS_FREQ: &[u8] = b"FREQ";

/// Verdict statuses a worker reports for compile and test calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Compiled / passed.
    Ok,
    /// Compilation error.
    CompileError,
    /// Wrong answer.
    WrongAnswer,
    /// Runtime error.
    RuntimeError,
    /// Time limit exceeded.
    TimeLimitExceeded,
    /// Memory limit exceeded.
    MemoryLimitExceeded,
    /// Infrastructure failure on the worker.
    Fail,
}

impl Status {
    /// Wire (and event log) spelling of the status.
    pub fn as_wire(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::CompileError => "CE",
            Status::WrongAnswer => "WA",
            Status::RuntimeError => "RE",
            Status::TimeLimitExceeded => "TL",
            Status::MemoryLimitExceeded => "ML",
            Status::Fail => "Fail",
        }
    }

    /// Parse a wire status. `None` for unrecognized values (including
    /// `FREQ`, which is not a verdict).
    pub fn from_wire(raw: &[u8]) -> Option<Status> {
        match raw {
            b"OK" => Some(Status::Ok),
            b"CE" => Some(Status::CompileError),
            b"WA" => Some(Status::WrongAnswer),
            b"RE" => Some(Status::RuntimeError),
            b"TL" => Some(Status::TimeLimitExceeded),
            b"ML" => Some(Status::MemoryLimitExceeded),
            b"Fail" => Some(Status::Fail),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Errors decoding message-level constructs.
#[derive(Debug, Error)]
pub enum MessageError {
    /// A file field did not carry the `hash\name\timestamp` header.
    #[error("malformed file field header")]
    MalformedFileField,

    /// A file field header carried a non-numeric timestamp.
    #[error("invalid file timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Build the correlation id for the given sequence number.
pub fn correlation_id(seq: u64) -> String {
    format!("id_{seq:08}")
}

/// A content blob referenced by a request.
///
/// Encodes as `hash\name\timestamp` followed by `|\r` and the raw bytes
/// when inlined, or as the bare header triple when the worker is expected
/// to hold a cached copy from an earlier job.
#[derive(Debug, Clone)]
pub struct FileRef {
    /// Content hash (hex digest).
    pub hash: String,
    /// Original filename.
    pub name: String,
    /// Creation timestamp of the blob, unix seconds.
    pub created: i64,
    /// Blob bytes.
    pub data: Bytes,
}

impl FileRef {
    /// Encode as a packet field value.
    pub fn encode(&self, inline: bool) -> Vec<u8> {
        let mut out = format!("{}\\{}\\{}", self.hash, self.name, self.created).into_bytes();
        if inline {
            out.extend_from_slice(b"|\r");
            out.extend_from_slice(&self.data);
        }
        out
    }
}

/// A file field as decoded from a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFile {
    /// Content hash claimed by the sender.
    pub hash: String,
    /// Original filename.
    pub name: String,
    /// Blob creation timestamp, unix seconds.
    pub created: i64,
    /// Inlined bytes; `None` when the field is a cache reference.
    pub data: Option<Bytes>,
}

impl DecodedFile {
    /// Decode a file field value.
    pub fn decode(raw: &[u8]) -> Result<DecodedFile, MessageError> {
        let (header, data) = match raw.windows(2).position(|w| w == b"|\r") {
            Some(at) => (&raw[..at], Some(Bytes::copy_from_slice(&raw[at + 2..]))),
            None => (raw, None),
        };
        let header = std::str::from_utf8(header).map_err(|_| MessageError::MalformedFileField)?;
        let mut parts = header.splitn(3, '\\');
        let hash = parts.next().ok_or(MessageError::MalformedFileField)?;
        let name = parts.next().ok_or(MessageError::MalformedFileField)?;
        let created = parts.next().ok_or(MessageError::MalformedFileField)?;
        let created: i64 = created
            .parse()
            .map_err(|_| MessageError::InvalidTimestamp(created.to_string()))?;
        Ok(DecodedFile {
            hash: hash.to_string(),
            name: name.to_string(),
            created,
            data,
        })
    }
}

/// Parse a `FREQ` file list: `\r\n`-separated `hash\name` entries.
/// Malformed entries are skipped with a warning.
pub fn parse_file_request(raw: &[u8]) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    for chunk in raw.split(|&b| b == b'\n') {
        let chunk = match chunk.strip_suffix(b"\r") {
            Some(stripped) => stripped,
            None => chunk,
        };
        if chunk.is_empty() {
            continue;
        }
        let Ok(entry) = std::str::from_utf8(chunk) else {
            tracing::warn!("skipping non-utf8 FREQ entry");
            continue;
        };
        match entry.split_once('\\') {
            Some((hash, name)) => entries.push((hash.to_string(), name.to_string())),
            None => tracing::warn!(entry, "skipping malformed FREQ entry"),
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========== Status ==========

    #[test]
    fn test_status_wire_round_trip() {
        for status in [
            Status::Ok,
            Status::CompileError,
            Status::WrongAnswer,
            Status::RuntimeError,
            Status::TimeLimitExceeded,
            Status::MemoryLimitExceeded,
            Status::Fail,
        ] {
            assert_eq!(Status::from_wire(status.as_wire().as_bytes()), Some(status));
        }
    }

    #[test]
    fn test_status_unknown() {
        assert_eq!(Status::from_wire(b"FREQ"), None);
        assert_eq!(Status::from_wire(b"ok"), None);
        assert_eq!(Status::from_wire(b""), None);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::TimeLimitExceeded.to_string(), "TL");
        assert_eq!(Status::Fail.to_string(), "Fail");
    }

    // ========== Correlation ids ==========

    #[test]
    fn test_correlation_id_format() {
        assert_eq!(correlation_id(0), "id_00000000");
        assert_eq!(correlation_id(42), "id_00000042");
        assert_eq!(correlation_id(123_456_789), "id_123456789");
    }

    // ========== File fields ==========

    fn file_ref() -> FileRef {
        FileRef {
            hash: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            name: "sol.cpp".to_string(),
            created: 1_700_000_000,
            data: Bytes::from_static(b"int main() {}\n"),
        }
    }

    #[test]
    fn test_file_ref_inline_round_trip() {
        let f = file_ref();
        let decoded = DecodedFile::decode(&f.encode(true)).unwrap();
        assert_eq!(decoded.hash, f.hash);
        assert_eq!(decoded.name, f.name);
        assert_eq!(decoded.created, f.created);
        assert_eq!(decoded.data.as_deref(), Some(&b"int main() {}\n"[..]));
    }

    #[test]
    fn test_file_ref_reference_round_trip() {
        let f = file_ref();
        let decoded = DecodedFile::decode(&f.encode(false)).unwrap();
        assert_eq!(decoded.hash, f.hash);
        assert_eq!(decoded.data, None);
    }

    #[test]
    fn test_file_ref_binary_payload() {
        let mut f = file_ref();
        f.data = Bytes::from_static(&[0u8, 1, 2, b'|', b'\r', 0xff]);
        let decoded = DecodedFile::decode(&f.encode(true)).unwrap();
        assert_eq!(decoded.data.as_deref(), Some(&[0u8, 1, 2, b'|', b'\r', 0xff][..]));
    }

    #[test]
    fn test_decode_malformed_header() {
        assert!(DecodedFile::decode(b"justahash").is_err());
        assert!(DecodedFile::decode(b"hash\\name\\notanumber").is_err());
        assert!(DecodedFile::decode(b"hash\\name").is_err());
    }

    // ========== FREQ lists ==========

    #[test]
    fn test_parse_file_request() {
        let raw = b"aaaa\\one.txt\r\nbbbb\\two.bin\r\n";
        let entries = parse_file_request(raw);
        assert_eq!(
            entries,
            vec![
                ("aaaa".to_string(), "one.txt".to_string()),
                ("bbbb".to_string(), "two.bin".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_file_request_no_trailing_newline() {
        let entries = parse_file_request(b"aaaa\\x");
        assert_eq!(entries, vec![("aaaa".to_string(), "x".to_string())]);
    }

    #[test]
    fn test_parse_file_request_skips_malformed() {
        let entries = parse_file_request(b"nobackslash\r\ncccc\\ok\r\n");
        assert_eq!(entries, vec![("cccc".to_string(), "ok".to_string())]);
    }

    #[test]
    fn test_parse_file_request_empty() {
        assert!(parse_file_request(b"").is_empty());
        assert!(parse_file_request(b"\r\n\r\n").is_empty());
    }
}
