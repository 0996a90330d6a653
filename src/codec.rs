// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Wire framing for the datagram link.
//!
//! Every datagram is one frame:
//!
//! ```text
//! [is_ack, ..seq_nr, sender_id, ..metadata_len, ..metadata,
//!  ..[payload_len, ..payload]]
//! ```
//!
//! All multi-byte fields are little-endian and the layout is fixed: frames
//! produced here must stay decodable by every other process in the group,
//! whatever host it runs on. Metadata is always present on the wire; "no
//! metadata" is encoded as a zero length. Payload slices carry their own
//! 2-byte length prefix and there is no slice count field: a decoder simply
//! reads slices until the buffer runs out.
//!
//! [`decode`] borrows into the receive buffer. The slices it hands back are
//! views, not copies, so a listener can run without touching the allocator
//! for each packet.

use std::fmt;
use thiserror::Error;

use crate::ProcessId;

/// Largest frame we will put on (or accept from) the wire. This is the
/// largest payload an IPv4 UDP datagram can carry; the kernel would refuse
/// anything bigger anyway.
pub const MAX_MESSAGE_SIZE: usize = 65_507;

/// Fixed-capacity cap on payload slices per frame.
pub const MAX_PAYLOAD_SLICES: usize = 8;

/// Bytes before the metadata length field: flag + seq_nr + sender_id.
const FIXED_HEADER: usize = 1 + 4 + 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The encoded frame would exceed [`MAX_MESSAGE_SIZE`].
    #[error("packet of {size} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit")]
    PacketTooLarge { size: usize },

    /// More payload slices than a frame can carry.
    #[error("{count} payload slices exceed the per-packet cap of {MAX_PAYLOAD_SLICES}")]
    TooManyPayloads { count: usize },

    /// A declared length points past the end of the buffer, or the buffer
    /// is shorter than a frame header.
    #[error("malformed packet")]
    MalformedPacket,
}

/// Payload slices of a decoded frame: a fixed-capacity array of views into
/// the receive buffer.
#[derive(Clone, Copy, Default)]
pub struct Payloads<'a> {
    slices: [&'a [u8]; MAX_PAYLOAD_SLICES],
    len: usize,
}

impl<'a> Payloads<'a> {
    fn push(&mut self, slice: &'a [u8]) -> Result<(), CodecError> {
        if self.len == MAX_PAYLOAD_SLICES {
            return Err(CodecError::MalformedPacket);
        }
        self.slices[self.len] = slice;
        self.len += 1;
        Ok(())
    }

    pub fn as_slice(&self) -> &[&'a [u8]] {
        &self.slices[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<'a> std::ops::Deref for Payloads<'a> {
    type Target = [&'a [u8]];
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl fmt::Debug for Payloads<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

/// One decoded frame. `metadata` and the payload slices borrow from the
/// buffer handed to [`decode`].
#[derive(Debug)]
pub struct Frame<'a> {
    pub is_ack: bool,
    pub seq_nr: u32,
    pub sender_id: ProcessId,
    pub metadata: &'a [u8],
    pub payloads: Payloads<'a>,
}

/// Encodes one frame. Fails (without side effects) if the result would not
/// fit in a datagram or carries too many slices.
pub fn encode(
    is_ack: bool,
    seq_nr: u32,
    sender_id: ProcessId,
    metadata: Option<&[u8]>,
    payloads: &[&[u8]],
) -> Result<Vec<u8>, CodecError> {
    if payloads.len() > MAX_PAYLOAD_SLICES {
        return Err(CodecError::TooManyPayloads {
            count: payloads.len(),
        });
    }
    let metadata = metadata.unwrap_or(&[]);
    let size = FIXED_HEADER
        + 2
        + metadata.len()
        + payloads.iter().map(|p| 2 + p.len()).sum::<usize>();
    if size > MAX_MESSAGE_SIZE {
        return Err(CodecError::PacketTooLarge { size });
    }

    let mut frame = Vec::with_capacity(size);
    frame.push(u8::from(is_ack));
    frame.extend_from_slice(&seq_nr.to_le_bytes());
    frame.push(sender_id);
    frame.extend_from_slice(&(metadata.len() as u16).to_le_bytes());
    frame.extend_from_slice(metadata);
    for payload in payloads {
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(payload);
    }
    Ok(frame)
}

/// Overwrites the sequence number of an already-encoded frame. Lets a
/// sender build the frame before it knows which number the link will
/// assign, keeping the numbering critical section small.
pub(crate) fn patch_seq_nr(frame: &mut [u8], seq_nr: u32) {
    frame[1..5].copy_from_slice(&seq_nr.to_le_bytes());
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&buf[at..at + 2]);
    u16::from_le_bytes(bytes)
}

/// Decodes one frame, borrowing metadata and payload slices from `buf`.
pub fn decode(buf: &[u8]) -> Result<Frame<'_>, CodecError> {
    if buf.len() < FIXED_HEADER + 2 || buf.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MalformedPacket);
    }
    let is_ack = match buf[0] {
        0 => false,
        1 => true,
        _ => return Err(CodecError::MalformedPacket),
    };
    let mut seq_bytes = [0u8; 4];
    seq_bytes.copy_from_slice(&buf[1..5]);
    let seq_nr = u32::from_le_bytes(seq_bytes);
    let sender_id = buf[5];

    let metadata_len = usize::from(read_u16(buf, FIXED_HEADER));
    let mut offset = FIXED_HEADER + 2;
    if buf.len() - offset < metadata_len {
        return Err(CodecError::MalformedPacket);
    }
    let metadata = &buf[offset..offset + metadata_len];
    offset += metadata_len;

    let mut payloads = Payloads::default();
    while offset < buf.len() {
        if buf.len() - offset < 2 {
            return Err(CodecError::MalformedPacket);
        }
        let len = usize::from(read_u16(buf, offset));
        offset += 2;
        if buf.len() - offset < len {
            return Err(CodecError::MalformedPacket);
        }
        payloads.push(&buf[offset..offset + len])?;
        offset += len;
    }

    Ok(Frame {
        is_ack,
        seq_nr,
        sender_id,
        metadata,
        payloads,
    })
}
