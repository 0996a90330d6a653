// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! FIFO broadcast: per-origin in-order delivery on top of uniform
//! reliable broadcast.
//!
//! The underlying layer already numbers each origin's broadcasts 1, 2, 3, ...
//! so ordering is purely a buffering problem: hold back anything early,
//! deliver runs of consecutive numbers. Nothing orders messages *across*
//! origins.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::net::SocketAddrV4;

use parking_lot::Mutex;

use crate::link::LinkError;
use crate::uniform::UniformReliableBroadcast;
use crate::{ProcessId, MAX_PROCESSES};

/// Reorder state for one origin: the next expected sequence number and a
/// min-heap of messages that arrived early.
pub(crate) struct ReorderBuffer {
    next_seq_nr: u32,
    early: BinaryHeap<Reverse<(u32, u32)>>,
}

impl ReorderBuffer {
    pub(crate) fn new() -> Self {
        ReorderBuffer {
            next_seq_nr: 1,
            early: BinaryHeap::new(),
        }
    }

    /// Accepts one `(seq_nr, value)` and emits everything now deliverable,
    /// in order.
    pub(crate) fn accept<F: FnMut(u32)>(&mut self, seq_nr: u32, value: u32, mut deliver: F) {
        if seq_nr != self.next_seq_nr {
            self.early.push(Reverse((seq_nr, value)));
            return;
        }
        deliver(value);
        self.next_seq_nr += 1;
        while let Some(&Reverse((seq_nr, value))) = self.early.peek() {
            if seq_nr != self.next_seq_nr {
                break;
            }
            self.early.pop();
            deliver(value);
            self.next_seq_nr += 1;
        }
    }
}

pub struct FifoBroadcast {
    link: UniformReliableBroadcast,
    reorder: Mutex<Vec<ReorderBuffer>>,
}

impl FifoBroadcast {
    pub fn new(id: ProcessId, processes: HashMap<ProcessId, SocketAddrV4>) -> Self {
        FifoBroadcast {
            link: UniformReliableBroadcast::new(id, processes),
            reorder: Mutex::new((0..MAX_PROCESSES).map(|_| ReorderBuffer::new()).collect()),
        }
    }

    pub fn id(&self) -> ProcessId {
        self.link.id()
    }

    pub fn bind(&self, addr: SocketAddrV4) -> Result<SocketAddrV4, LinkError> {
        self.link.bind(addr)
    }

    /// Broadcasts one value. Blocks until the previous broadcast has come
    /// back around and been delivered locally.
    pub fn broadcast(&self, value: u32) -> Result<(), LinkError> {
        self.link.broadcast(&[&value.to_le_bytes()])
    }

    /// Listens for broadcasts; `deliver` sees each origin's values in the
    /// order that origin broadcast them.
    pub fn listen<F>(&self, mut deliver: F) -> Result<(), LinkError>
    where
        F: FnMut(ProcessId, u32),
    {
        self.link.listen(|origin, seq_nr, payloads| {
            let value = match payloads.first().and_then(|p| p.get(..4)) {
                Some(bytes) => {
                    let mut value = [0u8; 4];
                    value.copy_from_slice(bytes);
                    u32::from_le_bytes(value)
                }
                None => {
                    debug_assert!(false, "broadcast {}:{} without a value", origin, seq_nr);
                    return;
                }
            };
            let mut reorder = self.reorder.lock();
            reorder[usize::from(origin) - 1].accept(seq_nr, value, |value| {
                deliver(origin, value)
            });
        })
    }

    pub fn shutdown(&self) {
        self.link.shutdown()
    }
}
