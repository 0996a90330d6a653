// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Best-effort broadcast: a perfect link fanned out over the whole group.
//!
//! Validity, no-duplication and no-creation carry over from the link,
//! pairwise. Nothing more is promised; in particular two correct processes
//! may deliver different sets of messages from a sender that crashed
//! mid-broadcast. Layers that need agreement build it on top.

use std::collections::HashMap;
use std::net::SocketAddrV4;

use crate::link::{LinkError, PerfectLink};
use crate::ProcessId;

pub struct BestEffortBroadcast {
    link: PerfectLink,
    processes: HashMap<ProcessId, SocketAddrV4>,
}

impl BestEffortBroadcast {
    pub fn new(id: ProcessId, processes: HashMap<ProcessId, SocketAddrV4>) -> Self {
        BestEffortBroadcast {
            link: PerfectLink::new(id),
            processes,
        }
    }

    pub fn id(&self) -> ProcessId {
        self.link.id()
    }

    pub fn processes(&self) -> &HashMap<ProcessId, SocketAddrV4> {
        &self.processes
    }

    pub fn bind(&self, addr: SocketAddrV4) -> Result<SocketAddrV4, LinkError> {
        self.link.bind(addr)
    }

    /// Sends to every known process, ourselves included.
    pub fn broadcast(
        &self,
        metadata: Option<&[u8]>,
        payloads: &[&[u8]],
    ) -> Result<(), LinkError> {
        for addr in self.processes.values() {
            self.link.send(*addr, metadata, payloads)?;
        }
        Ok(())
    }

    /// Sends to a single group member.
    pub fn send(
        &self,
        to: ProcessId,
        metadata: Option<&[u8]>,
        payloads: &[&[u8]],
    ) -> Result<(), LinkError> {
        let addr = self
            .processes
            .get(&to)
            .ok_or(LinkError::UnknownProcess(to))?;
        self.link.send(*addr, metadata, payloads)
    }

    pub fn listen<F>(&self, deliver: F) -> Result<(), LinkError>
    where
        F: FnMut(ProcessId, &[u8], &[&[u8]]),
    {
        self.link.listen(deliver)
    }

    pub fn shutdown(&self) {
        self.link.shutdown()
    }
}
