// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The membership of the group: who the processes are and where they live.
//!
//! A hosts file has one line per process, `<id> <hostname-or-ip> <port>`.
//! Ids must form exactly `{1, .., N}` with no gaps, with at least two
//! processes and at most [`MAX_PROCESSES`](crate::MAX_PROCESSES). Names are
//! resolved to IPv4 addresses exactly once, here; the resulting map never
//! changes for the life of the process.

use std::collections::HashMap;
use std::fs;
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::path::Path;

use thiserror::Error;

use crate::{ProcessId, MAX_PROCESSES};

#[derive(Debug, Error)]
pub enum HostsError {
    #[error("cannot read hosts file: {0}")]
    Io(#[from] std::io::Error),

    #[error("hosts file line {line} is not `<id> <host> <port>`")]
    Malformed { line: usize },

    #[error("host `{host}` does not resolve to an IPv4 address")]
    Unresolvable { host: String },

    #[error("process ids must be exactly 1..={count}, with no duplicates or gaps")]
    NonContiguousIds { count: usize },

    #[error("a group needs at least two processes")]
    TooFewHosts,

    #[error("a group cannot exceed {MAX_PROCESSES} processes")]
    TooManyHosts,
}

/// One resolved group member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Host {
    pub id: ProcessId,
    pub addr: SocketAddrV4,
}

/// The full, validated membership, ordered by id.
#[derive(Debug, Clone)]
pub struct Hosts {
    hosts: Vec<Host>,
}

impl Hosts {
    pub fn from_file(path: &Path) -> Result<Self, HostsError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn parse(text: &str) -> Result<Self, HostsError> {
        let mut hosts = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let entry = (|| {
                let id: ProcessId = fields.next()?.parse().ok()?;
                let name = fields.next()?;
                let port: u16 = fields.next()?.parse().ok()?;
                if fields.next().is_some() || id == 0 {
                    return None;
                }
                Some((id, name, port))
            })();
            let (id, name, port) = entry.ok_or(HostsError::Malformed { line: index + 1 })?;
            hosts.push(Host {
                id,
                addr: resolve(name, port)?,
            });
        }

        if hosts.len() < 2 {
            return Err(HostsError::TooFewHosts);
        }
        if hosts.len() > MAX_PROCESSES {
            return Err(HostsError::TooManyHosts);
        }
        hosts.sort_by_key(|h| h.id);
        let contiguous = hosts
            .iter()
            .enumerate()
            .all(|(i, h)| usize::from(h.id) == i + 1);
        if !contiguous {
            return Err(HostsError::NonContiguousIds { count: hosts.len() });
        }
        Ok(Hosts { hosts })
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Host> {
        self.hosts.iter()
    }

    pub fn address_of(&self, id: ProcessId) -> Option<SocketAddrV4> {
        self.hosts
            .get(usize::from(id).checked_sub(1)?)
            .map(|h| h.addr)
    }

    /// The id → address map the broadcast layers are built from.
    pub fn to_map(&self) -> HashMap<ProcessId, SocketAddrV4> {
        self.hosts.iter().map(|h| (h.id, h.addr)).collect()
    }
}

fn resolve(name: &str, port: u16) -> Result<SocketAddrV4, HostsError> {
    let addrs = (name, port)
        .to_socket_addrs()
        .map_err(|_| HostsError::Unresolvable {
            host: name.to_owned(),
        })?;
    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            return Ok(v4);
        }
    }
    Err(HostsError::Unresolvable {
        host: name.to_owned(),
    })
}
