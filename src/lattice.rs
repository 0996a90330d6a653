// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * Lattice agreement over best-effort broadcast.
 *
 * Weaker than consensus, and much cheaper: each process proposes a set of
 * values and decides a set, such that every decided set contains the
 * proposer's own values, contains nothing nobody proposed, and any two
 * decided sets are comparable (one includes the other). The domain is the
 * join semi-lattice of sets under union, so the proposal a process carries
 * can only ever grow.
 *
 * One instance runs many *agreements* in sequence, numbered from 0. Within
 * an agreement a proposer runs numbered *rounds*:
 *
 *   - it broadcasts its current proposed set;
 *   - every receiver folds the proposal into its accepted set and answers
 *     point-to-point -- Ack if it had nothing the proposer lacked, else
 *     Nack carrying the difference;
 *   - a majority of Acks decides; otherwise, once a majority has answered
 *     at all, the proposer starts the next round with the enlarged set.
 *
 * A config-known cap on the number of distinct values gives a shortcut:
 * once the proposed set is saturated no Nack can add anything, so the
 * proposer decides without waiting out the round.
 *
 * The protocol state is a plain steppable value ([`AgreementState`]) with
 * the I/O kept outside, so it can be driven by the listener thread, by a
 * simulated network, or by a model checker, all through the same
 * transitions.
 */

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddrV4;

use log::{debug, warn};
use parking_lot::Mutex;
use pergola::{BTreeSetWithUnion, LatticeElt};

use crate::best_effort::BestEffortBroadcast;
use crate::link::LinkError;
use crate::semaphore::Semaphore;
use crate::ProcessId;

/// The value domain: sets of `u32` joined by union.
pub type ValueSetLD = BTreeSetWithUnion<u32>;
pub type ValueSetLE = LatticeElt<ValueSetLD>;

/// Agreements a process may drive at once. One: a proposal is accepted
/// only after the previous agreement decided.
const MAX_IN_FLIGHT: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Proposal = 0,
    Ack = 1,
    Nack = 2,
}

impl MessageKind {
    fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(MessageKind::Proposal),
            1 => Some(MessageKind::Ack),
            2 => Some(MessageKind::Nack),
            _ => None,
        }
    }
}

/// What a receiver answers to a proposal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProposalReply {
    Ack,
    /// The values the receiver had accepted that the proposal lacked.
    Nack(BTreeSet<u32>),
}

/// What an ack or nack did to the proposer's round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Stale round or already decided; nothing happened.
    Ignored,
    /// Counted; the round continues.
    Waiting,
    /// The agreement decided this set.
    Decided(BTreeSet<u32>),
    /// A majority answered without a deciding majority of acks: re-propose
    /// the enlarged set under the next round number.
    NewRound {
        proposal_nr: u32,
        proposed: BTreeSet<u32>,
    },
}

/// Per-agreement protocol state, both for our own proposing and for
/// answering peers. Counters track only *our* current round; the value
/// lattices grow monotonically for the life of the agreement.
#[derive(Debug, Clone, Default)]
pub struct AgreementState {
    ack_count: u32,
    nack_count: u32,
    proposed_value: ValueSetLE,
    accepted_value: ValueSetLE,
    proposal_nr: u32,
    has_decided: bool,
}

// Manually implement Eq/Hash over the underlying sets rather than the
// lattice wrappers, mirroring how Ord is only conditionally meaningful
// for lattice elements.
impl PartialEq for AgreementState {
    fn eq(&self, other: &Self) -> bool {
        (
            self.ack_count,
            self.nack_count,
            &self.proposed_value.value,
            &self.accepted_value.value,
            self.proposal_nr,
            self.has_decided,
        ) == (
            other.ack_count,
            other.nack_count,
            &other.proposed_value.value,
            &other.accepted_value.value,
            other.proposal_nr,
            other.has_decided,
        )
    }
}
impl Eq for AgreementState {}

impl std::hash::Hash for AgreementState {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ack_count.hash(state);
        self.nack_count.hash(state);
        self.proposed_value.value.hash(state);
        self.accepted_value.value.hash(state);
        self.proposal_nr.hash(state);
        self.has_decided.hash(state);
    }
}

impl AgreementState {
    /// Starts proposing `values` in round 0 of this agreement.
    pub fn begin(&mut self, values: BTreeSet<u32>) {
        self.proposed_value = ValueSetLE::new_from(values);
    }

    pub fn has_decided(&self) -> bool {
        self.has_decided
    }

    pub fn proposal_nr(&self) -> u32 {
        self.proposal_nr
    }

    pub fn proposed(&self) -> &BTreeSet<u32> {
        &self.proposed_value.value
    }

    /// Folds a peer's proposal into the accepted set and says how to
    /// answer: Ack if we had nothing the proposer lacked, otherwise Nack
    /// carrying the difference.
    pub fn handle_proposal(&mut self, values: &BTreeSet<u32>) -> ProposalReply {
        let difference: BTreeSet<u32> = self
            .accepted_value
            .value
            .difference(values)
            .copied()
            .collect();
        self.accepted_value =
            &self.accepted_value + &ValueSetLE::new_from(values.clone());
        if difference.is_empty() {
            ProposalReply::Ack
        } else {
            ProposalReply::Nack(difference)
        }
    }

    /// Counts an ack for round `proposal_nr` of our proposal.
    pub fn handle_ack(&mut self, proposal_nr: u32, n: usize, max_unique: usize) -> Step {
        if self.has_decided || proposal_nr != self.proposal_nr {
            return Step::Ignored;
        }
        self.ack_count += 1;
        if 2 * self.ack_count as usize >= n {
            return self.decide(max_unique);
        }
        self.next_round_if_settled(n)
    }

    /// Counts a nack, folding the values it carries into our proposal.
    pub fn handle_nack(
        &mut self,
        proposal_nr: u32,
        extras: &BTreeSet<u32>,
        n: usize,
        max_unique: usize,
    ) -> Step {
        if self.has_decided || proposal_nr != self.proposal_nr {
            return Step::Ignored;
        }
        self.proposed_value =
            &self.proposed_value + &ValueSetLE::new_from(extras.clone());
        self.nack_count += 1;
        // Saturation shortcut: once the proposal holds every value that
        // exists, no further nack can enlarge it.
        if self.proposed_value.value.len() == max_unique {
            return self.decide(max_unique);
        }
        self.next_round_if_settled(n)
    }

    /// Once a majority has answered one way or the other without the acks
    /// alone deciding, the round is settled: move on with the grown set.
    fn next_round_if_settled(&mut self, n: usize) -> Step {
        if 2 * (self.ack_count + self.nack_count) as usize >= n {
            self.proposal_nr += 1;
            self.ack_count = 0;
            self.nack_count = 0;
            Step::NewRound {
                proposal_nr: self.proposal_nr,
                proposed: self.proposed_value.value.clone(),
            }
        } else {
            Step::Waiting
        }
    }

    fn decide(&mut self, max_unique: usize) -> Step {
        self.has_decided = true;
        if self.proposed_value.value.len() == max_unique {
            // Fold the saturated set into what we have accepted, so a
            // lagging proposer gets an immediate ack instead of a pointless
            // round trip of nacks.
            self.accepted_value = &self.accepted_value + &self.proposed_value;
        }
        Step::Decided(self.proposed_value.value.clone())
    }
}

// Wire framing, inside a broadcast payload:
// [kind, ..agreement_nr, ..proposal_nr, ..values]
pub(crate) fn encode_frame(
    kind: MessageKind,
    agreement_nr: u32,
    proposal_nr: u32,
    values: &BTreeSet<u32>,
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(9 + 4 * values.len());
    frame.push(kind as u8);
    frame.extend_from_slice(&agreement_nr.to_le_bytes());
    frame.extend_from_slice(&proposal_nr.to_le_bytes());
    for value in values {
        frame.extend_from_slice(&value.to_le_bytes());
    }
    frame
}

pub(crate) fn decode_frame(frame: &[u8]) -> Option<(MessageKind, u32, u32, BTreeSet<u32>)> {
    if frame.len() < 9 || (frame.len() - 9) % 4 != 0 {
        return None;
    }
    let kind = MessageKind::from_wire(frame[0])?;
    let mut word = [0u8; 4];
    word.copy_from_slice(&frame[1..5]);
    let agreement_nr = u32::from_le_bytes(word);
    word.copy_from_slice(&frame[5..9]);
    let proposal_nr = u32::from_le_bytes(word);
    let values = frame[9..]
        .chunks_exact(4)
        .map(|chunk| {
            word.copy_from_slice(chunk);
            u32::from_le_bytes(word)
        })
        .collect();
    Some((kind, agreement_nr, proposal_nr, values))
}

struct Instances {
    next_agreement_nr: u32,
    agreements: HashMap<u32, AgreementState>,
}

pub struct LatticeAgreement {
    link: BestEffortBroadcast,
    max_unique_values: usize,
    instances: Mutex<Instances>,
    in_flight: Semaphore,
}

impl LatticeAgreement {
    /// `max_unique_values` is the config-known cap on distinct values
    /// across all proposals of one agreement.
    pub fn new(
        id: ProcessId,
        processes: HashMap<ProcessId, SocketAddrV4>,
        max_unique_values: usize,
    ) -> Self {
        LatticeAgreement {
            link: BestEffortBroadcast::new(id, processes),
            max_unique_values,
            instances: Mutex::new(Instances {
                next_agreement_nr: 0,
                agreements: HashMap::new(),
            }),
            in_flight: Semaphore::new(MAX_IN_FLIGHT),
        }
    }

    pub fn id(&self) -> ProcessId {
        self.link.id()
    }

    pub fn bind(&self, addr: SocketAddrV4) -> Result<SocketAddrV4, LinkError> {
        self.link.bind(addr)
    }

    /// Starts the next agreement, proposing `values`. Returns once the
    /// proposal is on the wire; the decision arrives through the listener.
    /// Blocks while the previous agreement is still undecided.
    pub fn propose(&self, values: BTreeSet<u32>) -> Result<(), LinkError> {
        self.in_flight.acquire();
        let frame = {
            let mut instances = self.instances.lock();
            let agreement_nr = instances.next_agreement_nr;
            instances.next_agreement_nr += 1;
            let agreement = instances.agreements.entry(agreement_nr).or_default();
            agreement.begin(values);
            debug!("proposing agreement {}", agreement_nr);
            encode_frame(
                MessageKind::Proposal,
                agreement_nr,
                agreement.proposal_nr(),
                agreement.proposed(),
            )
        };
        self.link.broadcast(None, &[&frame])
    }

    /// Listens for protocol traffic; `decide` is called once per agreement
    /// this process proposed, with the decided set.
    pub fn listen<F>(&self, mut decide: F) -> Result<(), LinkError>
    where
        F: FnMut(&BTreeSet<u32>),
    {
        let n = self.link.processes().len();
        self.link.listen(|sender, _metadata, payloads| {
            let frame = match payloads.first() {
                Some(frame) => *frame,
                None => return,
            };
            let (kind, agreement_nr, proposal_nr, values) = match decode_frame(frame) {
                Some(decoded) => decoded,
                None => {
                    debug_assert!(false, "undecodable agreement frame from {}", sender);
                    return;
                }
            };

            match kind {
                MessageKind::Proposal => {
                    let reply = {
                        let mut instances = self.instances.lock();
                        instances
                            .agreements
                            .entry(agreement_nr)
                            .or_default()
                            .handle_proposal(&values)
                    };
                    let answer = match reply {
                        ProposalReply::Ack => {
                            encode_frame(MessageKind::Ack, agreement_nr, proposal_nr, &BTreeSet::new())
                        }
                        ProposalReply::Nack(difference) => {
                            encode_frame(MessageKind::Nack, agreement_nr, proposal_nr, &difference)
                        }
                    };
                    if let Err(err) = self.link.send(sender, None, &[&answer]) {
                        warn!("answering proposal from {} failed: {}", sender, err);
                    }
                }
                MessageKind::Ack | MessageKind::Nack => {
                    let step = {
                        let mut instances = self.instances.lock();
                        let agreement = match instances.agreements.get_mut(&agreement_nr) {
                            Some(agreement) => agreement,
                            None => {
                                debug_assert!(
                                    false,
                                    "answer for unknown agreement {} from {}",
                                    agreement_nr, sender
                                );
                                return;
                            }
                        };
                        match kind {
                            MessageKind::Ack => {
                                agreement.handle_ack(proposal_nr, n, self.max_unique_values)
                            }
                            _ => agreement.handle_nack(
                                proposal_nr,
                                &values,
                                n,
                                self.max_unique_values,
                            ),
                        }
                    };
                    match step {
                        Step::Ignored | Step::Waiting => {}
                        Step::Decided(decided) => {
                            debug!("agreement {} decided", agreement_nr);
                            decide(&decided);
                            self.in_flight.release();
                        }
                        Step::NewRound {
                            proposal_nr,
                            proposed,
                        } => {
                            debug!("agreement {} advancing to round {}", agreement_nr, proposal_nr);
                            let frame = encode_frame(
                                MessageKind::Proposal,
                                agreement_nr,
                                proposal_nr,
                                &proposed,
                            );
                            if let Err(err) = self.link.broadcast(None, &[&frame]) {
                                warn!("re-proposing agreement {} failed: {}", agreement_nr, err);
                            }
                        }
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.link.shutdown()
    }
}
