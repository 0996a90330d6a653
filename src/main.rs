// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The process binary.
//!
//! One process of the group, driven by three files: the hosts file naming
//! everyone, a mode-specific config, and the output path for the event
//! log. The workload is picked at build time by cargo feature --
//! `perfect-links`, `fifo` (the default) or `lattice-agreement` -- so a
//! deployment ships one binary per experiment.
//!
//! The process runs until SIGTERM/SIGINT. The signal thread freezes the
//! event log, flushes it, and exits; nothing else is shut down gracefully,
//! matching the crash-stop model the protocols assume.

use std::collections::BTreeSet;
use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use entente::link::LinkError;
use entente::{
    FifoBroadcast, FifoConfig, Hosts, LatticeAgreement, LatticeConfig, Logger, PerfectLink,
    PerfectLinksConfig, ProcessId,
};

#[derive(Parser, Debug)]
#[command(name = "entente", about = "one process of a message-passing group")]
struct Args {
    /// This process's id in the hosts file.
    #[arg(long)]
    id: ProcessId,

    /// Hosts file: one `<id> <host> <port>` line per process.
    #[arg(long)]
    hosts: PathBuf,

    /// Where to write the event log.
    #[arg(long)]
    output: PathBuf,

    /// Mode-specific configuration file.
    config: PathBuf,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            process::exit(1);
        }
    };
    pretty_env_logger::init();
    if let Err(err) = run(args) {
        eprintln!("{:#}", err);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let logger = Arc::new(Logger::create(&args.output)?);

    // Signals are installed before any socket exists, so a kill during
    // startup still leaves a consistent (possibly empty) output file.
    let mut signals = Signals::new([SIGTERM, SIGINT])?;
    {
        let logger = Arc::clone(&logger);
        thread::spawn(move || {
            if signals.forever().next().is_some() {
                logger.freeze();
                process::exit(0);
            }
        });
    }

    let hosts = Hosts::from_file(&args.hosts)?;
    let me = hosts
        .address_of(args.id)
        .context("own id is not in the hosts file")?;
    info!(
        "process {} on {}, pid {} (kill -TERM {} to stop and flush)",
        args.id,
        me,
        process::id(),
        process::id()
    );

    if cfg!(feature = "perfect-links") {
        run_perfect_links(&args, &hosts, me, &logger)
    } else if cfg!(feature = "lattice-agreement") {
        run_lattice_agreement(&args, &hosts, me, &logger)
    } else {
        run_fifo(&args, &hosts, me, &logger)
    }
}

/// Everyone but the configured receiver sends `1..=M` to it.
fn run_perfect_links(
    args: &Args,
    hosts: &Hosts,
    me: SocketAddrV4,
    logger: &Logger,
) -> Result<()> {
    let config = PerfectLinksConfig::from_file(&args.config)?;
    let link = PerfectLink::new(args.id);
    link.bind(me)?;
    let receiving = args.id == config.receiver;

    thread::scope(|s| {
        s.spawn(|| {
            exit_on_error(link.listen(|sender, _metadata, payloads| {
                if !receiving {
                    return;
                }
                if let Some(value) = first_value(payloads) {
                    logger.deliver(sender, value);
                }
            }))
        });

        if !receiving {
            let dest = hosts.address_of(config.receiver).unwrap_or_else(|| {
                eprintln!("receiver {} is not in the hosts file", config.receiver);
                process::exit(1);
            });
            for n in 1..=config.messages {
                or_die(link.send(dest, None, &[&n.to_le_bytes()]));
                logger.broadcast(n);
            }
            info!("done sending {} messages", config.messages);
        }
        wait_forever()
    })
}

/// Every process broadcasts `1..=M`; deliveries are in per-origin order.
fn run_fifo(args: &Args, hosts: &Hosts, me: SocketAddrV4, logger: &Logger) -> Result<()> {
    let config = FifoConfig::from_file(&args.config)?;
    let link = FifoBroadcast::new(args.id, hosts.to_map());
    link.bind(me)?;

    thread::scope(|s| {
        s.spawn(|| exit_on_error(link.listen(|origin, value| logger.deliver(origin, value))));

        for n in 1..=config.messages {
            or_die(link.broadcast(n));
            logger.broadcast(n);
        }
        info!("done broadcasting {} messages", config.messages);
        wait_forever()
    })
}

/// One agreement per config line; decided sets land in the output file in
/// agreement order (proposals are strictly serialised).
fn run_lattice_agreement(
    args: &Args,
    hosts: &Hosts,
    me: SocketAddrV4,
    logger: &Logger,
) -> Result<()> {
    let mut config = LatticeConfig::open(&args.config)?;
    let link = LatticeAgreement::new(args.id, hosts.to_map(), config.max_unique_values);
    link.bind(me)?;
    let agreements = config.agreements;

    thread::scope(|s| {
        s.spawn(|| {
            exit_on_error(link.listen(|decided: &BTreeSet<u32>| logger.decide(decided)))
        });

        for proposal in &mut config {
            match proposal {
                Ok(values) => or_die(link.propose(values)),
                Err(err) => {
                    eprintln!("{}", err);
                    process::exit(1);
                }
            }
        }
        info!("done proposing {} agreements", agreements);
        wait_forever()
    })
}

fn first_value(payloads: &[&[u8]]) -> Option<u32> {
    let bytes = payloads.first().and_then(|p| p.get(..4))?;
    let mut word = [0u8; 4];
    word.copy_from_slice(bytes);
    Some(u32::from_le_bytes(word))
}

fn or_die<T>(result: std::result::Result<T, LinkError>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            eprintln!("fatal link error: {}", err);
            process::exit(1);
        }
    }
}

fn exit_on_error(result: std::result::Result<(), LinkError>) {
    if let Err(err) = result {
        eprintln!("listener failed: {}", err);
        process::exit(1);
    }
}

/// The broadcast part of a run ends, the process does not: it keeps
/// listening (and re-sending) until a signal kills it.
fn wait_forever() -> ! {
    loop {
        thread::park();
    }
}
