// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * This crate is a small toolkit of asynchronous message-passing
 * primitives, layered from an unreliable datagram socket up to a weak
 * form of agreement:
 *
 *   - [`link::PerfectLink`] -- reliable, deduplicated point-to-point
 *     delivery over UDP (acknowledge, time out, re-send, forever);
 *   - [`best_effort::BestEffortBroadcast`] -- the link fanned out over a
 *     fixed group;
 *   - [`uniform::UniformReliableBroadcast`] -- majority-acknowledged
 *     delivery: if anyone delivers, every correct process does;
 *   - [`fifo::FifoBroadcast`] -- per-origin in-order delivery;
 *   - [`lattice::LatticeAgreement`] -- agreement on sets of values,
 *     decided sets pairwise comparable under inclusion.
 *
 * Every layer assumes crash-stop failures and a strict majority of
 * correct processes, and nothing survives a restart: a process that
 * crashes is simply gone. There is no Byzantine tolerance and no flow
 * control beyond a fixed cap on unacknowledged messages.
 *
 * The concurrency model is deliberately old-fashioned: one blocking
 * listener thread per link, senders on whatever threads the caller
 * likes, and fine-grained mutexes around the few shared maps. Protocol
 * logic that can be expressed as a pure state transition (the agreement
 * rounds, the reorder buffers) is kept free of I/O, so the same
 * transitions run under the listener thread, a simulated network, or a
 * model checker.
 *
 * ## Reference
 *
 * Christian Cachin, Rachid Guerraoui, Luís Rodrigues. Introduction to
 * Reliable and Secure Distributed Programming. Springer, 2011.
 *
 * Hagit Attiya, Maurice Herlihy, Ophir Rachman. Atomic snapshots using
 * lattice agreement. Distributed Computing 8, 1995.
 *
 * ## Name
 *
 * Wikipedia:
 *
 * > The Entente Cordiale comprised a series of agreements signed on
 * > 8 April 1904 between the United Kingdom and the French Republic
 * >
 * > ...
 * >
 * > the Entente Cordiale marked the start of an alliance that endured
 * > through two world wars.
 *
 * An entente between processes is more modest, but it also has to
 * survive its members failing to answer.
 */

// TODO: garbage-collect broadcast identities once their origin is suspected crashed.
// TODO: consider a dense (vector) representation for the agreement table.

pub mod best_effort;
pub mod codec;
pub mod config;
pub mod fifo;
pub mod hosts;
pub mod lattice;
pub mod link;
pub mod logger;
pub mod semaphore;
pub mod uniform;

#[cfg(test)]
mod tests;

pub use best_effort::BestEffortBroadcast;
pub use codec::{CodecError, Frame, MAX_MESSAGE_SIZE, MAX_PAYLOAD_SLICES};
pub use config::{ConfigError, FifoConfig, LatticeConfig, PerfectLinksConfig};
pub use fifo::FifoBroadcast;
pub use hosts::{Host, Hosts, HostsError};
pub use lattice::{AgreementState, LatticeAgreement};
pub use link::{LinkError, PerfectLink, MAX_IN_FLIGHT, RESEND_TIMEOUT};
pub use logger::Logger;
pub use semaphore::Semaphore;
pub use uniform::UniformReliableBroadcast;

/// A process identity: an integer in `1..=MAX_PROCESSES`, assigned by the
/// hosts file. Zero never names a process.
pub type ProcessId = u8;

/// The largest group this toolkit supports.
pub const MAX_PROCESSES: usize = 128;
