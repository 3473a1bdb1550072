// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Escaped key/value packet framing.
//!
//! Wire format: `\0---\0` + fields joined by `\0` + `\0+++\0`, each field
//! `escaped(key)=escaped(value)` with keys sorted on encode. A byte below
//! `0x20` is escaped as the two bytes `0x18, byte ^ 0x40` (the escape byte
//! `0x18` is below `0x20` and therefore escapes itself).

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

/// Start-of-packet magic.
pub const START_MAGIC: &[u8; 5] = b"\0---\0";

/// End-of-packet magic.
pub const END_MAGIC: &[u8; 5] = b"\0+++\0";

/// Escape introducer; the following byte is the escaped value XOR `0x40`.
const ESCAPE: u8 = 0x18;

/// An unordered collection of key/value byte-string fields.
///
/// Keys are unique within a packet. Values decoded from the wire may be
/// absent when the sender transmitted a bare key without `=`; the encoder
/// never produces such fields itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    fields: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl Packet {
    /// Create an empty packet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a field, replacing any previous value under the same key.
    pub fn insert(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.fields.insert(key.into(), Some(value.into()));
    }

    /// Look up a field value. Bare keys decoded without a value read as absent.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.fields.get(key).and_then(|v| v.as_deref())
    }

    /// Whether the packet carries the given key (with or without a value).
    pub fn contains(&self, key: &[u8]) -> bool {
        self.fields.contains_key(key)
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the packet has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate over fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], Option<&[u8]>)> {
        self.fields
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_deref()))
    }

    /// Encode the packet for wire transmission. Fields are emitted in key
    /// order; absent values are written as empty.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            START_MAGIC.len()
                + END_MAGIC.len()
                + self
                    .fields
                    .iter()
                    .map(|(k, v)| k.len() + v.as_ref().map_or(0, Vec::len) + 2)
                    .sum::<usize>(),
        );
        buf.put_slice(START_MAGIC);
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                buf.put_u8(0);
            }
            escape_into(key, &mut buf);
            buf.put_u8(b'=');
            if let Some(value) = value {
                escape_into(value, &mut buf);
            }
        }
        buf.put_slice(END_MAGIC);
        buf.freeze()
    }
}

impl<K: Into<Vec<u8>>, V: Into<Vec<u8>>> FromIterator<(K, V)> for Packet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut packet = Packet::new();
        for (k, v) in iter {
            packet.insert(k, v);
        }
        packet
    }
}

fn escape_into(data: &[u8], buf: &mut BytesMut) {
    for &b in data {
        if b < 0x20 {
            buf.put_u8(ESCAPE);
            buf.put_u8(b ^ 0x40);
        } else {
            buf.put_u8(b);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Matching the start magic at the given index.
    Magic(usize),
    /// Reading key or value bytes.
    Body { in_value: bool, escape: bool },
    /// Matching the end magic at the given index. Index 0 is never stored:
    /// the `\0` that terminates a field doubles as the first magic byte.
    End(usize),
}

/// Incremental packet decoder.
///
/// Feed byte chunks in arrival order; completed packets accumulate until
/// [`drain`](PacketParser::drain) is called. Unexpected bytes outside a
/// packet body cause a silent reset, resynchronizing on the next start
/// magic. A mismatch one byte into the end magic is reinterpreted as key
/// data (an unescaped `\0` followed by a non-`+` byte starts a new field);
/// a mismatch deeper into the end magic discards the packet under
/// construction.
#[derive(Debug)]
pub struct PacketParser {
    state: State,
    key: Vec<u8>,
    value: Option<Vec<u8>>,
    fields: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    complete: Vec<Packet>,
}

impl Default for PacketParser {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketParser {
    /// Create a parser waiting for the start magic.
    pub fn new() -> Self {
        Self {
            state: State::Magic(0),
            key: Vec::new(),
            value: None,
            fields: BTreeMap::new(),
            complete: Vec::new(),
        }
    }

    /// Consume a chunk of received bytes.
    pub fn feed(&mut self, data: &[u8]) {
        for &b in data {
            self.step(b);
        }
    }

    /// Return all packets completed since the previous call.
    pub fn drain(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.complete)
    }

    fn reset(&mut self) {
        self.key.clear();
        self.value = None;
        self.fields.clear();
        self.state = State::Magic(0);
    }

    fn finish_field(&mut self) {
        let key = std::mem::take(&mut self.key);
        let value = self.value.take();
        self.fields.insert(key, value);
    }

    fn step(&mut self, b: u8) {
        match self.state {
            State::Magic(index) => {
                if START_MAGIC[index] != b {
                    // The mismatched byte is consumed; resync on the next
                    // full start magic.
                    self.reset();
                } else if index + 1 == START_MAGIC.len() {
                    self.state = State::Body {
                        in_value: false,
                        escape: false,
                    };
                } else {
                    self.state = State::Magic(index + 1);
                }
            }
            State::Body { in_value, escape } => {
                if b == 0 && !escape {
                    self.finish_field();
                    self.state = State::End(1);
                    return;
                }
                if b == ESCAPE {
                    if escape {
                        self.reset();
                        return;
                    }
                    self.state = State::Body {
                        in_value,
                        escape: true,
                    };
                    return;
                }
                let mut b = b;
                if escape {
                    b ^= 0x40;
                    if b >= 0x20 {
                        self.reset();
                        return;
                    }
                }
                if b == b'=' && !in_value {
                    self.value = Some(Vec::new());
                    self.state = State::Body {
                        in_value: true,
                        escape: false,
                    };
                    return;
                }
                if in_value {
                    if let Some(value) = &mut self.value {
                        value.push(b);
                    }
                } else {
                    self.key.push(b);
                }
                self.state = State::Body {
                    in_value,
                    escape: false,
                };
            }
            State::End(index) => {
                if END_MAGIC[index] != b {
                    if index == 1 {
                        // `\0` + non-`+`: the terminator byte actually
                        // started the next field; keep the byte as key data.
                        self.key.push(b);
                        self.state = State::Body {
                            in_value: false,
                            escape: false,
                        };
                    } else {
                        self.reset();
                    }
                } else if index + 1 == END_MAGIC.len() {
                    let fields = std::mem::take(&mut self.fields);
                    self.complete.push(Packet { fields });
                    self.reset();
                } else {
                    self.state = State::End(index + 1);
                }
            }
        }
    }
}
