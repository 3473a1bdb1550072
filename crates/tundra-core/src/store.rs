// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The durable ledger: append-only event log plus append-only content store.
//!
//! The event log is UTF-8 text, one record per line: unix timestamp, event
//! name, then the fields, tab-separated. A null field is a bare `-`; any
//! other field is double-quoted with every code point ≤ 0x20 (plus `\` and
//! `"`) written as a backslash followed by the code point shifted up by 48.
//! The content store is raw concatenated blob bytes, addressed only by the
//! `(offset, length)` pairs captured in `content` events.
//!
//! Both files are strictly append-only. The log's line order is the only
//! consistency mechanism the system has: replaying the lines in file order
//! reconstructs the exact in-memory state, so truncating or reordering
//! either file invalidates the deployment.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use tracing::info;

use crate::error::{CoreError, Result};

/// A parsed event log line, not yet interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Unix timestamp of the append.
    pub timestamp: i64,
    /// Event name.
    pub name: String,
    /// Ordered fields; `None` was written as `-`.
    pub fields: Vec<Option<String>>,
}

/// Append-only storage for events and content blobs.
#[derive(Debug)]
pub struct Ledger {
    log: File,
    bin: File,
    bin_len: u64,
}

impl Ledger {
    /// Open (creating if absent) `<prefix>.log` and `<prefix>.bin` and
    /// return the ledger together with every existing record in log order.
    /// The caller replays the records before appending anything new.
    pub fn open(prefix: &str) -> Result<(Self, Vec<Record>)> {
        let log_path = PathBuf::from(format!("{prefix}.log"));
        let bin_path = PathBuf::from(format!("{prefix}.bin"));

        let bin = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&bin_path)
            .map_err(|e| CoreError::store("open content store", e))?;
        let bin_len = bin
            .metadata()
            .map_err(|e| CoreError::store("stat content store", e))?
            .len();
        info!(path = %bin_path.display(), size = bin_len, "opened content store");

        let text = match std::fs::read_to_string(&log_path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(CoreError::store("read event log", e)),
        };
        let mut records = Vec::new();
        for (index, line) in text.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            records.push(parse_record(line, index + 1)?);
        }
        info!(
            path = %log_path.display(),
            bytes = text.len(),
            records = records.len(),
            "read event log"
        );

        let log = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&log_path)
            .map_err(|e| CoreError::store("open event log", e))?;

        Ok((Self { log, bin, bin_len }, records))
    }

    /// Append one event record and flush it to stable storage. The caller
    /// replays the event into the domain model before reporting success,
    /// so durability always precedes visibility.
    pub fn append(&mut self, timestamp: i64, name: &str, fields: &[Option<String>]) -> Result<()> {
        let mut line = encode_record(timestamp, name, fields);
        line.push('\n');
        self.log
            .write_all(line.as_bytes())
            .map_err(|e| CoreError::store("append event", e))?;
        self.log
            .sync_data()
            .map_err(|e| CoreError::store("sync event log", e))?;
        Ok(())
    }

    /// Append a blob to the content store and return its locator.
    pub fn save_blob(&mut self, data: &[u8]) -> Result<(u64, u64)> {
        let offset = self.bin_len;
        self.bin
            .write_all(data)
            .map_err(|e| CoreError::store("append content", e))?;
        self.bin
            .sync_data()
            .map_err(|e| CoreError::store("sync content store", e))?;
        self.bin_len += data.len() as u64;
        Ok((offset, data.len() as u64))
    }

    /// Random-access read from the content store.
    pub fn load(&mut self, offset: u64, length: u64) -> Result<Vec<u8>> {
        if offset.checked_add(length).is_none_or(|end| end > self.bin_len) {
            return Err(CoreError::RangeOutOfBounds {
                offset,
                length,
                size: self.bin_len,
            });
        }
        self.bin
            .seek(SeekFrom::Start(offset))
            .map_err(|e| CoreError::store("seek content store", e))?;
        let mut data = vec![0u8; length as usize];
        self.bin
            .read_exact(&mut data)
            .map_err(|e| CoreError::store("read content store", e))?;
        Ok(data)
    }

    /// Current size of the content store in bytes.
    pub fn content_size(&self) -> u64 {
        self.bin_len
    }
}

fn encode_record(timestamp: i64, name: &str, fields: &[Option<String>]) -> String {
    let mut line = format!("{timestamp}\t{name}");
    for field in fields {
        line.push('\t');
        match field {
            None => line.push('-'),
            Some(value) => {
                line.push('"');
                escape_field(value, &mut line);
                line.push('"');
            }
        }
    }
    line
}

fn escape_field(value: &str, out: &mut String) {
    for ch in value.chars() {
        if ch as u32 > 32 && ch != '\\' && ch != '"' {
            out.push(ch);
        } else {
            out.push('\\');
            // Escaped inputs are at most U+005C, so the shift stays a
            // valid code point.
            out.push(char::from_u32(ch as u32 + 48).unwrap_or('\u{FFFD}'));
        }
    }
}

fn decode_field(raw: &str) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        let shifted = chars
            .next()
            .ok_or_else(|| "dangling escape".to_string())?;
        let code = (shifted as u32)
            .checked_sub(48)
            .ok_or_else(|| format!("bad escape: {shifted:?}"))?;
        out.push(char::from_u32(code).ok_or_else(|| format!("bad escape: {shifted:?}"))?);
    }
    Ok(out)
}

fn parse_record(line: &str, lineno: usize) -> Result<Record> {
    let record_err = |reason: String| CoreError::Record {
        line: lineno,
        reason,
    };

    let mut tokens = line.split_whitespace();
    let timestamp: i64 = tokens
        .next()
        .ok_or_else(|| record_err("missing timestamp".to_string()))?
        .parse()
        .map_err(|_| record_err("invalid timestamp".to_string()))?;
    let name = tokens
        .next()
        .ok_or_else(|| record_err("missing event name".to_string()))?
        .to_string();

    let mut fields = Vec::new();
    for token in tokens {
        if token == "-" {
            fields.push(None);
        } else if token.len() >= 2 && token.starts_with('"') && token.ends_with('"') {
            let inner = &token[1..token.len() - 1];
            fields.push(Some(decode_field(inner).map_err(record_err)?));
        } else {
            return Err(record_err(format!("unquoted field: {token:?}")));
        }
    }

    Ok(Record {
        timestamp,
        name,
        fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_prefix(dir: &tempfile::TempDir) -> String {
        dir.path().join("contest").to_string_lossy().into_owned()
    }

    // ========== Field escaping ==========

    #[test]
    fn test_field_round_trip_plain() {
        let mut out = String::new();
        escape_field("sol.cpp", &mut out);
        assert_eq!(out, "sol.cpp");
        assert_eq!(decode_field(&out).unwrap(), "sol.cpp");
    }

    #[test]
    fn test_field_round_trip_whitespace_and_quotes() {
        for value in [
            "two words",
            "tab\there",
            "line\nbreak",
            "quote\"inside",
            "back\\slash",
            "",
            " ",
            "\u{1}\u{2}\u{3}",
        ] {
            let mut escaped = String::new();
            escape_field(value, &mut escaped);
            assert!(
                !escaped.contains(char::is_whitespace),
                "escaped form must be a single token: {escaped:?}"
            );
            assert!(!escaped.contains('"'));
            assert_eq!(decode_field(&escaped).unwrap(), value, "value {value:?}");
        }
    }

    #[test]
    fn test_decode_field_errors() {
        assert!(decode_field("dangling\\").is_err());
        assert!(decode_field("bad\\\u{1}").is_err());
    }

    // ========== Record lines ==========

    #[test]
    fn test_record_round_trip() {
        let fields = vec![
            Some("g++".to_string()),
            None,
            Some("g++ -O2 -o $binary $name".to_string()),
            Some("".to_string()),
        ];
        let line = encode_record(1_700_000_000, "compiler.add", &fields);
        let record = parse_record(&line, 1).unwrap();
        assert_eq!(record.timestamp, 1_700_000_000);
        assert_eq!(record.name, "compiler.add");
        assert_eq!(record.fields, fields);
    }

    #[test]
    fn test_record_no_fields() {
        let line = encode_record(5, "ping", &[]);
        assert_eq!(line, "5\tping");
        let record = parse_record(&line, 1).unwrap();
        assert!(record.fields.is_empty());
    }

    #[test]
    fn test_parse_record_errors() {
        assert!(matches!(
            parse_record("", 3),
            Err(CoreError::Record { line: 3, .. })
        ));
        assert!(parse_record("notatime\tevent", 1).is_err());
        assert!(parse_record("100\tevent\tunquoted", 1).is_err());
        assert!(parse_record("100", 1).is_err());
    }

    // ========== Ledger ==========

    #[test]
    fn test_ledger_append_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = tmp_prefix(&dir);

        {
            let (mut ledger, records) = Ledger::open(&prefix).unwrap();
            assert!(records.is_empty());
            ledger
                .append(100, "team.add", &[Some("a".into()), Some("b".into()), None])
                .unwrap();
            ledger.append(101, "archive.add", &[Some("0".into())]).unwrap();
        }

        let (_, records) = Ledger::open(&prefix).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].timestamp, 100);
        assert_eq!(records[0].name, "team.add");
        assert_eq!(
            records[0].fields,
            vec![Some("a".to_string()), Some("b".to_string()), None]
        );
        assert_eq!(records[1].name, "archive.add");
    }

    #[test]
    fn test_ledger_blob_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ledger, _) = Ledger::open(&tmp_prefix(&dir)).unwrap();

        let (off_a, len_a) = ledger.save_blob(b"first blob").unwrap();
        let (off_b, len_b) = ledger.save_blob(&[0u8, 255, 17]).unwrap();
        assert_eq!(off_a, 0);
        assert_eq!(len_a, 10);
        assert_eq!(off_b, 10);
        assert_eq!(len_b, 3);

        assert_eq!(ledger.load(off_a, len_a).unwrap(), b"first blob");
        assert_eq!(ledger.load(off_b, len_b).unwrap(), vec![0u8, 255, 17]);
        // Reads do not disturb the append position.
        let (off_c, _) = ledger.save_blob(b"x").unwrap();
        assert_eq!(off_c, 13);
    }

    #[test]
    fn test_ledger_blob_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = tmp_prefix(&dir);

        let locator = {
            let (mut ledger, _) = Ledger::open(&prefix).unwrap();
            ledger.save_blob(b"durable bytes").unwrap()
        };

        let (mut ledger, _) = Ledger::open(&prefix).unwrap();
        assert_eq!(ledger.content_size(), 13);
        assert_eq!(ledger.load(locator.0, locator.1).unwrap(), b"durable bytes");
    }

    #[test]
    fn test_ledger_load_out_of_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ledger, _) = Ledger::open(&tmp_prefix(&dir)).unwrap();
        ledger.save_blob(b"0123456789").unwrap();

        assert!(matches!(
            ledger.load(5, 10),
            Err(CoreError::RangeOutOfBounds { .. })
        ));
        assert!(matches!(
            ledger.load(u64::MAX, 1),
            Err(CoreError::RangeOutOfBounds { .. })
        ));
        assert!(ledger.load(10, 0).unwrap().is_empty());
    }

    #[test]
    fn test_ledger_rejects_malformed_log() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = tmp_prefix(&dir);
        std::fs::write(format!("{prefix}.log"), "garbage line\n").unwrap();

        assert!(matches!(
            Ledger::open(&prefix),
            Err(CoreError::Record { line: 1, .. })
        ));
    }
}
