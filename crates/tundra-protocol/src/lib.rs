// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tundra Protocol - wire layer for the judge channel
//!
//! This crate provides the wire protocol spoken between the tundra core and
//! its remote judges (and by the legacy control channel). It is deliberately
//! sans-I/O: packets are encoded to byte buffers and decoded from byte
//! chunks in whatever order the transport delivers them; nothing in here
//! touches a socket.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     tundra-protocol                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Messages: statuses, file transfer fields, FREQ lists       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Packets: escaped key/value fields, \0---\0 … \0+++\0       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Framing
//!
//! A packet is an unordered set of key/value byte strings. On the wire it is
//! `\0---\0`, the fields joined by `\0` (each `key=value`, keys sorted),
//! then `\0+++\0`. Bytes below `0x20` are escaped as the pair
//! `0x18, byte ^ 0x40`; this covers the escape byte itself. The decoder is
//! a byte-at-a-time state machine that accepts arbitrarily fragmented input
//! and silently resynchronizes on framing garbage.
//!
//! # Usage
//!
//! ```
//! use tundra_protocol::{Packet, PacketParser};
//!
//! let mut packet = Packet::new();
//! packet.insert("Command", "compile");
//! packet.insert("ID", "id_00000001");
//! let wire = packet.encode();
//!
//! let mut parser = PacketParser::new();
//! parser.feed(&wire);
//! let decoded = parser.drain();
//! assert_eq!(decoded.len(), 1);
//! assert_eq!(decoded[0].get(b"Command"), Some(&b"compile"[..]));
//! ```

pub mod message;
pub mod packet;

pub use message::{
    DecodedFile, FileRef, MessageError, Status, correlation_id, parse_file_request,
};
pub use packet::{Packet, PacketParser};
