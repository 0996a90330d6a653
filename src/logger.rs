// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The event log a run leaves behind.
//!
//! Deliveries happen on the listener's hot path, so events are buffered in
//! memory and written out either when the buffer fills or at shutdown.
//! Shutdown is signal-driven: the signal thread calls [`Logger::freeze`],
//! which takes the lock, writes everything buffered, and leaves the logger
//! refusing further appends so the file stays consistent while the process
//! exits.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use itertools::Itertools;
use log::warn;
use parking_lot::Mutex;

use crate::ProcessId;

/// Buffered events before an automatic flush.
const FLUSH_THRESHOLD: usize = 1 << 20;

enum Event {
    Broadcast(u32),
    Deliver(ProcessId, u32),
    Decide(BTreeSet<u32>),
}

struct Inner {
    out: BufWriter<File>,
    events: Vec<Event>,
    frozen: bool,
}

pub struct Logger {
    inner: Mutex<Inner>,
}

impl Logger {
    pub fn create(path: &Path) -> io::Result<Logger> {
        Ok(Logger {
            inner: Mutex::new(Inner {
                out: BufWriter::new(File::create(path)?),
                events: Vec::new(),
                frozen: false,
            }),
        })
    }

    /// Records `b <n>`.
    pub fn broadcast(&self, n: u32) {
        self.append(Event::Broadcast(n));
    }

    /// Records `d <origin> <n>`.
    pub fn deliver(&self, origin: ProcessId, n: u32) {
        self.append(Event::Deliver(origin, n));
    }

    /// Records a decided set, one line, values space-separated.
    pub fn decide(&self, values: &BTreeSet<u32>) {
        self.append(Event::Decide(values.clone()));
    }

    fn append(&self, event: Event) {
        let mut inner = self.inner.lock();
        if inner.frozen {
            return;
        }
        inner.events.push(event);
        if inner.events.len() >= FLUSH_THRESHOLD {
            if let Err(err) = write_events(&mut inner) {
                warn!("flushing the event log failed: {}", err);
            }
        }
    }

    /// Writes everything buffered to the file.
    pub fn flush(&self) -> io::Result<()> {
        let mut inner = self.inner.lock();
        write_events(&mut inner)?;
        inner.out.flush()
    }

    /// Final flush: writes everything buffered, then refuses any further
    /// appends. Called from the signal path right before exit.
    pub fn freeze(&self) {
        let mut inner = self.inner.lock();
        inner.frozen = true;
        let written = write_events(&mut inner);
        if let Err(err) = written.and_then(|_| inner.out.flush()) {
            warn!("final flush of the event log failed: {}", err);
        }
    }
}

fn write_events(inner: &mut Inner) -> io::Result<()> {
    for event in std::mem::take(&mut inner.events) {
        match event {
            Event::Broadcast(n) => writeln!(inner.out, "b {}", n)?,
            Event::Deliver(origin, n) => writeln!(inner.out, "d {} {}", origin, n)?,
            Event::Decide(values) => writeln!(inner.out, "{}", values.iter().join(" "))?,
        }
    }
    Ok(())
}
