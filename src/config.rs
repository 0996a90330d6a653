// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Per-mode configuration files.
//!
//! Each binary mode reads a different shape of config:
//!
//! - perfect-links: `<M> <I>` -- everyone but process `I` sends `M`
//!   integers to `I`;
//! - fifo: `<M>` -- every process broadcasts `1..=M`;
//! - lattice agreement: a `<P> <VS> <DS>` header (number of agreements,
//!   max values per proposal, max distinct values overall) followed by `P`
//!   proposal lines.
//!
//! Proposal lines are streamed rather than loaded: a config can describe
//! millions of agreements and we only ever hold one line.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

use thiserror::Error;

use crate::ProcessId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerfectLinksConfig {
    pub messages: u32,
    pub receiver: ProcessId,
}

impl PerfectLinksConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut fields = text.split_whitespace();
        let messages = next_number(&mut fields, "expected a message count")?;
        let receiver = fields
            .next()
            .and_then(|f| f.parse().ok())
            .filter(|&id| id != 0)
            .ok_or(ConfigError::Malformed("expected a receiver id"))?;
        Ok(PerfectLinksConfig { messages, receiver })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FifoConfig {
    pub messages: u32,
}

impl FifoConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut fields = text.split_whitespace();
        let messages = next_number(&mut fields, "expected a message count")?;
        Ok(FifoConfig { messages })
    }
}

/// Lattice-agreement config: header values plus a lazy stream of proposal
/// lines. Iterating yields one proposal set per agreement.
pub struct LatticeConfig {
    pub agreements: u32,
    pub max_proposal_size: usize,
    pub max_unique_values: usize,
    lines: Lines<BufReader<File>>,
    yielded: u32,
}

impl LatticeConfig {
    pub fn open(path: &Path) -> Result<Self, ConfigError> {
        let mut lines = BufReader::new(File::open(path)?).lines();
        let header = lines
            .next()
            .ok_or(ConfigError::Malformed("missing header line"))??;
        let mut fields = header.split_whitespace();
        let agreements = next_number(&mut fields, "expected an agreement count")?;
        let max_proposal_size =
            next_number::<usize>(&mut fields, "expected a max proposal size")?;
        let max_unique_values =
            next_number::<usize>(&mut fields, "expected a max unique value count")?;
        if max_unique_values == 0 {
            return Err(ConfigError::Malformed("max unique value count must be positive"));
        }
        Ok(LatticeConfig {
            agreements,
            max_proposal_size,
            max_unique_values,
            lines,
            yielded: 0,
        })
    }

    fn parse_proposal(&self, line: &str) -> Result<BTreeSet<u32>, ConfigError> {
        let mut values = BTreeSet::new();
        for field in line.split_whitespace() {
            let value = field
                .parse()
                .map_err(|_| ConfigError::Malformed("proposal values must be u32"))?;
            values.insert(value);
        }
        if values.is_empty() {
            return Err(ConfigError::Malformed("empty proposal line"));
        }
        if values.len() > self.max_proposal_size {
            return Err(ConfigError::Malformed("proposal exceeds the declared size"));
        }
        Ok(values)
    }
}

impl Iterator for LatticeConfig {
    type Item = Result<BTreeSet<u32>, ConfigError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.yielded < self.agreements {
            let line = match self.lines.next() {
                Some(Ok(line)) => line,
                Some(Err(err)) => return Some(Err(err.into())),
                None => {
                    return Some(Err(ConfigError::Malformed(
                        "fewer proposal lines than the header declares",
                    )))
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            self.yielded += 1;
            return Some(self.parse_proposal(&line));
        }
        None
    }
}

fn next_number<T: std::str::FromStr>(
    fields: &mut std::str::SplitWhitespace<'_>,
    what: &'static str,
) -> Result<T, ConfigError> {
    fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or(ConfigError::Malformed(what))
}
