// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * Uniform reliable broadcast.
 *
 * On top of best-effort fan-out this adds the uniform agreement property:
 * if *any* process -- even one that crashes right after -- delivers a
 * message, every correct process eventually delivers it. The standard
 * majority construction does the work:
 *
 *   - every broadcast carries a 64-bit identity `(origin, seq_nr)` as link
 *     metadata, so relays of the same broadcast are recognisable;
 *   - the first time a process sees an identity, it re-broadcasts the
 *     message (relay on first sight);
 *   - each process tracks, per identity, the set of processes it has seen
 *     the message from, and delivers exactly when that set reaches a
 *     majority.
 *
 * The threshold is crossed exactly once, so delivering *at* the crossing
 * gives at-most-once delivery without a separate delivered set. With a
 * correct majority, anyone delivering implies a majority of relayers,
 * which implies everyone eventually hears it: uniformity.
 *
 * Identity entries are never reclaimed; memory is traded against the
 * bookkeeping a distributed garbage collection would need.
 */

use std::collections::HashMap;
use std::net::SocketAddrV4;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::best_effort::BestEffortBroadcast;
use crate::link::LinkError;
use crate::semaphore::Semaphore;
use crate::{ProcessId, MAX_PROCESSES};

/// Broadcasts a process may have unacknowledged at once. Kept at one: a
/// new broadcast waits until the previous one came back around and was
/// delivered locally.
const MAX_IN_FLIGHT: usize = 1;

/// `(origin, seq_nr)` packed with the origin in the low byte.
fn identity(origin: ProcessId, seq_nr: u32) -> u64 {
    (u64::from(seq_nr) << 8) | u64::from(origin)
}

struct Broadcasts {
    next_seq_nr: u32,
    /// Which processes each identity has been seen from, one bit per
    /// process id. Presence of an entry means pending or delivered.
    acknowledged: HashMap<u64, u128>,
}

pub struct UniformReliableBroadcast {
    link: BestEffortBroadcast,
    broadcasts: Mutex<Broadcasts>,
    in_flight: Semaphore,
}

impl UniformReliableBroadcast {
    pub fn new(id: ProcessId, processes: HashMap<ProcessId, SocketAddrV4>) -> Self {
        UniformReliableBroadcast {
            link: BestEffortBroadcast::new(id, processes),
            broadcasts: Mutex::new(Broadcasts {
                next_seq_nr: 1,
                acknowledged: HashMap::new(),
            }),
            in_flight: Semaphore::new(MAX_IN_FLIGHT),
        }
    }

    pub fn id(&self) -> ProcessId {
        self.link.id()
    }

    fn majority(&self) -> u32 {
        (self.link.processes().len() / 2 + 1) as u32
    }

    pub fn bind(&self, addr: SocketAddrV4) -> Result<SocketAddrV4, LinkError> {
        self.link.bind(addr)
    }

    /// Broadcasts `payloads` under this process's next identity. Blocks
    /// until the previous broadcast has been delivered locally.
    pub fn broadcast(&self, payloads: &[&[u8]]) -> Result<(), LinkError> {
        self.in_flight.acquire();
        let id = {
            let mut broadcasts = self.broadcasts.lock();
            let seq_nr = broadcasts.next_seq_nr;
            broadcasts.next_seq_nr += 1;
            let id = identity(self.id(), seq_nr);
            broadcasts.acknowledged.insert(id, 0);
            id
        };
        self.link.broadcast(Some(&id.to_le_bytes()), payloads)
    }

    /// Listens for broadcasts; `deliver` gets the origin id, the origin's
    /// sequence number and the payload slices, at most once per identity.
    pub fn listen<F>(&self, mut deliver: F) -> Result<(), LinkError>
    where
        F: FnMut(ProcessId, u32, &[&[u8]]),
    {
        let majority = self.majority();
        self.link.listen(|sender, metadata, payloads| {
            let id = match <[u8; 8]>::try_from(metadata) {
                Ok(bytes) => u64::from_le_bytes(bytes),
                Err(_) => {
                    debug_assert!(false, "broadcast without an identity from {}", sender);
                    return;
                }
            };
            let origin = (id & 0xff) as ProcessId;
            let seq_nr = (id >> 8) as u32;
            if origin == 0
                || usize::from(origin) > MAX_PROCESSES
                || sender == 0
                || usize::from(sender) > MAX_PROCESSES
            {
                debug_assert!(false, "broadcast with impossible process ids");
                return;
            }

            let (first_sight, crossed_majority) = {
                let mut broadcasts = self.broadcasts.lock();
                let mut first_sight = false;
                let acks = broadcasts.acknowledged.entry(id).or_insert_with(|| {
                    first_sight = true;
                    0
                });
                let bit = 1u128 << (sender - 1);
                let had_acked = *acks & bit != 0;
                *acks |= bit;
                let crossed = !had_acked && acks.count_ones() == majority;
                (first_sight, crossed)
            };

            // Relaying on first sight is what makes agreement uniform:
            // whoever manages to deliver has, by then, a majority of
            // processes re-sending on its behalf.
            if first_sight {
                if let Err(err) = self.link.broadcast(Some(metadata), payloads) {
                    warn!("relay of broadcast {}:{} failed: {}", origin, seq_nr, err);
                }
            }

            if crossed_majority {
                debug!("delivering broadcast {}:{}", origin, seq_nr);
                deliver(origin, seq_nr, payloads);
                if origin == self.id() {
                    self.in_flight.release();
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.link.shutdown()
    }
}
