// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write as _;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::codec;
use crate::fifo::ReorderBuffer;
use crate::lattice::{decode_frame, encode_frame, AgreementState, MessageKind, ProposalReply, Step};
use crate::*;

fn localhost(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
}

/// Grabs `count` distinct loopback addresses by binding throwaway sockets
/// on port 0 and releasing them again.
fn reserve_addrs(count: usize) -> Vec<SocketAddrV4> {
    let socks: Vec<UdpSocket> = (0..count)
        .map(|_| UdpSocket::bind("127.0.0.1:0").unwrap())
        .collect();
    socks
        .iter()
        .map(|s| match s.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!(),
        })
        .collect()
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(25));
    }
    false
}

// ---------------------------------------------------------------------
// framing

#[test]
fn frame_roundtrip() {
    let frame = codec::encode(
        false,
        81,
        7,
        Some(b"meta"),
        &[b"alpha", b"", b"gamma"],
    )
    .unwrap();
    let decoded = codec::decode(&frame).unwrap();
    assert!(!decoded.is_ack);
    assert_eq!(decoded.seq_nr, 81);
    assert_eq!(decoded.sender_id, 7);
    assert_eq!(decoded.metadata, b"meta");
    assert_eq!(
        decoded.payloads.as_slice(),
        &[b"alpha" as &[u8], b"", b"gamma"]
    );
}

#[test]
fn frame_without_metadata_roundtrips_as_empty() {
    let frame = codec::encode(false, 1, 1, None, &[b"x"]).unwrap();
    let decoded = codec::decode(&frame).unwrap();
    assert_eq!(decoded.metadata, b"");
    assert_eq!(decoded.payloads.len(), 1);
}

#[test]
fn ack_frame_is_header_only() {
    let frame = codec::encode(true, 93, 2, None, &[]).unwrap();
    assert_eq!(frame.len(), 8);
    let decoded = codec::decode(&frame).unwrap();
    assert!(decoded.is_ack);
    assert_eq!(decoded.seq_nr, 93);
    assert!(decoded.payloads.is_empty());
}

#[test]
fn oversized_frame_is_rejected() {
    let big = vec![0u8; codec::MAX_MESSAGE_SIZE];
    let err = codec::encode(false, 1, 1, None, &[&big]).unwrap_err();
    assert!(matches!(err, CodecError::PacketTooLarge { .. }));
}

#[test]
fn too_many_payload_slices_are_rejected() {
    let slice: &[u8] = b"v";
    let nine = [slice; 9];
    let err = codec::encode(false, 1, 1, None, &nine).unwrap_err();
    assert!(matches!(err, CodecError::TooManyPayloads { count: 9 }));
}

#[test]
fn truncated_frames_never_decode_past_the_buffer() {
    let frame = codec::encode(false, 5, 3, Some(b"md"), &[b"one", b"two"]).unwrap();
    // Whatever prefix arrives, decode must either fail or describe only
    // bytes inside that prefix.
    for len in 0..frame.len() {
        let _ = codec::decode(&frame[..len]);
    }
    assert!(codec::decode(&[]).is_err());
    assert!(codec::decode(&frame[..7]).is_err());
    // A declared metadata length past the end of the buffer.
    let mut lying = frame.clone();
    lying[6] = 0xff;
    lying[7] = 0xff;
    assert_eq!(codec::decode(&lying).unwrap_err(), CodecError::MalformedPacket);
}

// ---------------------------------------------------------------------
// semaphore

#[test]
fn semaphore_blocks_until_released() {
    let gate = Arc::new(Semaphore::new(1));
    gate.acquire();

    let (tx, rx) = mpsc::channel();
    let handle = {
        let gate = Arc::clone(&gate);
        thread::spawn(move || {
            gate.acquire();
            tx.send(()).unwrap();
        })
    };

    assert!(
        rx.recv_timeout(Duration::from_millis(100)).is_err(),
        "second acquire must block while the permit is held"
    );
    gate.release();
    assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    handle.join().unwrap();
}

// ---------------------------------------------------------------------
// hosts and configs

#[test]
fn hosts_parse_and_resolve() {
    let hosts = Hosts::parse("1 127.0.0.1 11001\n2 localhost 11002\n").unwrap();
    assert_eq!(hosts.len(), 2);
    assert_eq!(hosts.address_of(1), Some(localhost(11001)));
    assert_eq!(hosts.address_of(2), Some(localhost(11002)));
    assert_eq!(hosts.address_of(3), None);
}

#[test]
fn hosts_ids_must_be_contiguous_from_one() {
    assert!(matches!(
        Hosts::parse("1 127.0.0.1 1\n3 127.0.0.1 2\n"),
        Err(HostsError::NonContiguousIds { .. })
    ));
    assert!(matches!(
        Hosts::parse("2 127.0.0.1 1\n3 127.0.0.1 2\n"),
        Err(HostsError::NonContiguousIds { .. })
    ));
    assert!(matches!(
        Hosts::parse("1 127.0.0.1 1\n"),
        Err(HostsError::TooFewHosts)
    ));
}

#[test]
fn hosts_reject_garbage_lines() {
    assert!(matches!(
        Hosts::parse("1 127.0.0.1\n2 127.0.0.1 2\n"),
        Err(HostsError::Malformed { line: 1 })
    ));
    assert!(matches!(
        Hosts::parse("1 127.0.0.1 notaport\n2 127.0.0.1 2\n"),
        Err(HostsError::Malformed { line: 1 })
    ));
}

#[test]
fn hosts_file_roundtrip() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "1 127.0.0.1 11001\n2 127.0.0.1 11002\n").unwrap();
    let hosts = Hosts::from_file(file.path()).unwrap();
    assert_eq!(hosts.to_map().len(), 2);
}

#[test]
fn perfect_links_config_parses() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "100 3\n").unwrap();
    let config = PerfectLinksConfig::from_file(file.path()).unwrap();
    assert_eq!(config.messages, 100);
    assert_eq!(config.receiver, 3);
}

#[test]
fn fifo_config_parses() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "42\n").unwrap();
    assert_eq!(FifoConfig::from_file(file.path()).unwrap().messages, 42);
}

#[test]
fn lattice_config_streams_proposals() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "3 2 4\n1 2\n3\n4 1\n").unwrap();
    let mut config = LatticeConfig::open(file.path()).unwrap();
    assert_eq!(config.agreements, 3);
    assert_eq!(config.max_proposal_size, 2);
    assert_eq!(config.max_unique_values, 4);

    let proposals: Vec<BTreeSet<u32>> = (&mut config).map(|p| p.unwrap()).collect();
    assert_eq!(
        proposals,
        vec![
            BTreeSet::from([1, 2]),
            BTreeSet::from([3]),
            BTreeSet::from([1, 4]),
        ]
    );
}

#[test]
fn lattice_config_rejects_missing_lines() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "2 1 2\n1\n").unwrap();
    let mut config = LatticeConfig::open(file.path()).unwrap();
    assert!(config.next().unwrap().is_ok());
    assert!(config.next().unwrap().is_err());
}

// ---------------------------------------------------------------------
// logger

#[test]
fn logger_writes_events_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    let logger = Logger::create(&path).unwrap();
    logger.broadcast(1);
    logger.deliver(2, 7);
    logger.decide(&BTreeSet::from([3, 1, 2]));
    logger.flush().unwrap();
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "b 1\nd 2 7\n1 2 3\n"
    );
}

#[test]
fn frozen_logger_drops_further_events() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    let logger = Logger::create(&path).unwrap();
    logger.broadcast(1);
    logger.freeze();
    logger.broadcast(2);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "b 1\n");
}

// ---------------------------------------------------------------------
// fifo reordering

#[test]
fn reorder_buffer_delivers_runs_in_order() {
    let mut buffer = ReorderBuffer::new();
    let mut seen = Vec::new();
    buffer.accept(2, 20, |v| seen.push(v));
    buffer.accept(3, 30, |v| seen.push(v));
    assert!(seen.is_empty(), "early messages are held back");
    buffer.accept(1, 10, |v| seen.push(v));
    assert_eq!(seen, vec![10, 20, 30]);
    buffer.accept(5, 50, |v| seen.push(v));
    buffer.accept(4, 40, |v| seen.push(v));
    assert_eq!(seen, vec![10, 20, 30, 40, 50]);
}

// ---------------------------------------------------------------------
// agreement core

#[test]
fn agreement_frames_roundtrip() {
    let values = BTreeSet::from([5, 9, 1]);
    let frame = encode_frame(MessageKind::Nack, 3, 2, &values);
    assert_eq!(decode_frame(&frame), Some((MessageKind::Nack, 3, 2, values)));
    assert!(decode_frame(&frame[..8]).is_none());
    assert!(decode_frame(&frame[..frame.len() - 1]).is_none());
    assert!(decode_frame(&[9, 0, 0, 0, 0, 0, 0, 0, 0]).is_none());
}

#[test]
fn majority_of_acks_decides() {
    let mut state = AgreementState::default();
    state.begin(BTreeSet::from([1, 2]));
    assert_eq!(state.handle_ack(0, 3, 10), Step::Waiting);
    assert_eq!(
        state.handle_ack(0, 3, 10),
        Step::Decided(BTreeSet::from([1, 2]))
    );
    assert!(state.has_decided());
    assert_eq!(state.handle_ack(0, 3, 10), Step::Ignored);
}

#[test]
fn settled_round_advances_with_the_grown_set() {
    let mut state = AgreementState::default();
    state.begin(BTreeSet::from([1]));
    assert_eq!(
        state.handle_nack(0, &BTreeSet::from([2]), 3, 10),
        Step::Waiting
    );
    // Second answer settles the round: one ack + one nack is a majority
    // of three, without a deciding majority of acks.
    assert_eq!(
        state.handle_ack(0, 3, 10),
        Step::NewRound {
            proposal_nr: 1,
            proposed: BTreeSet::from([1, 2]),
        }
    );
    // Answers for the finished round no longer count.
    assert_eq!(state.handle_ack(0, 3, 10), Step::Ignored);
    assert_eq!(state.proposal_nr(), 1);
}

#[test]
fn saturated_proposal_decides_without_a_majority() {
    let mut state = AgreementState::default();
    state.begin(BTreeSet::from([1]));
    assert_eq!(
        state.handle_nack(0, &BTreeSet::from([2]), 5, 2),
        Step::Decided(BTreeSet::from([1, 2]))
    );
}

#[test]
fn proposals_are_acked_iff_nothing_is_missing() {
    let mut state = AgreementState::default();
    assert_eq!(state.handle_proposal(&BTreeSet::from([1, 2])), ProposalReply::Ack);
    assert_eq!(
        state.handle_proposal(&BTreeSet::from([1])),
        ProposalReply::Nack(BTreeSet::from([2]))
    );
    // The difference is against everything accepted so far.
    assert_eq!(
        state.handle_proposal(&BTreeSet::from([1, 2, 3])),
        ProposalReply::Ack
    );
}

// A deterministic in-memory network of agreement cores, stepped until
// every peer decides. The routing mirrors the real shell: proposals go to
// everyone (the proposer included), answers go point-to-point.
mod simulated {
    use super::*;

    #[derive(Clone, Debug)]
    enum Msg {
        Proposal {
            from: ProcessId,
            round: u32,
            values: BTreeSet<u32>,
        },
        Answer {
            from: ProcessId,
            to: ProcessId,
            round: u32,
            reply: ProposalReply,
        },
    }

    struct PeerRecord {
        incoming: Vec<Msg>,
        state: AgreementState,
        decided: Option<BTreeSet<u32>>,
    }

    struct Network {
        peers: BTreeMap<ProcessId, PeerRecord>,
        max_unique: usize,
    }

    impl Network {
        fn new(proposals: &[(ProcessId, BTreeSet<u32>)], max_unique: usize) -> Self {
            let mut peers = BTreeMap::new();
            for (id, values) in proposals {
                let mut state = AgreementState::default();
                state.begin(values.clone());
                peers.insert(
                    *id,
                    PeerRecord {
                        incoming: vec![],
                        state,
                        decided: None,
                    },
                );
            }
            let mut network = Network { peers, max_unique };
            let first: Vec<Msg> = network
                .peers
                .iter()
                .map(|(id, p)| Msg::Proposal {
                    from: *id,
                    round: 0,
                    values: p.state.proposed().clone(),
                })
                .collect();
            for msg in first {
                network.route(msg);
            }
            network
        }

        fn route(&mut self, msg: Msg) {
            match &msg {
                Msg::Proposal { .. } => {
                    for peer in self.peers.values_mut() {
                        peer.incoming.push(msg.clone());
                    }
                }
                Msg::Answer { to, .. } => {
                    self.peers.get_mut(to).unwrap().incoming.push(msg);
                }
            }
        }

        fn all_decided(&self) -> bool {
            self.peers.values().all(|p| p.decided.is_some())
        }

        fn step(&mut self) {
            let n = self.peers.len();
            let max_unique = self.max_unique;
            let mut outgoing = Vec::new();
            for (id, peer) in self.peers.iter_mut() {
                for msg in std::mem::take(&mut peer.incoming) {
                    match msg {
                        Msg::Proposal { from, round, values } => {
                            let reply = peer.state.handle_proposal(&values);
                            outgoing.push(Msg::Answer {
                                from: *id,
                                to: from,
                                round,
                                reply,
                            });
                        }
                        Msg::Answer { round, reply, .. } => {
                            let step = match reply {
                                ProposalReply::Ack => {
                                    peer.state.handle_ack(round, n, max_unique)
                                }
                                ProposalReply::Nack(extras) => {
                                    peer.state.handle_nack(round, &extras, n, max_unique)
                                }
                            };
                            match step {
                                Step::Ignored | Step::Waiting => {}
                                Step::Decided(values) => peer.decided = Some(values),
                                Step::NewRound { proposal_nr, proposed } => {
                                    outgoing.push(Msg::Proposal {
                                        from: *id,
                                        round: proposal_nr,
                                        values: proposed,
                                    });
                                }
                            }
                        }
                    }
                }
            }
            for msg in outgoing {
                self.route(msg);
            }
        }
    }

    #[test]
    fn simulated_peers_decide_comparable_supersets() {
        let _ = pretty_env_logger::try_init();
        let proposals = [
            (1, BTreeSet::from([1])),
            (2, BTreeSet::from([2])),
            (3, BTreeSet::from([1, 2])),
        ];
        let mut network = Network::new(&proposals, 2);

        let mut steps = 0;
        while !network.all_decided() {
            network.step();
            steps += 1;
            assert!(steps < 1000, "agreement failed to terminate");
        }

        let union: BTreeSet<u32> = proposals.iter().flat_map(|(_, p)| p.clone()).collect();
        let decided: Vec<(ProcessId, BTreeSet<u32>)> = network
            .peers
            .iter()
            .map(|(id, p)| (*id, p.decided.clone().unwrap()))
            .collect();

        for (id, set) in &decided {
            let own = &proposals.iter().find(|(p, _)| p == id).unwrap().1;
            assert!(own.is_subset(set), "decision must contain the peer's input");
            assert!(set.is_subset(&union), "decision must not invent values");
        }
        for (_, a) in &decided {
            for (_, b) in &decided {
                assert!(
                    a.is_subset(b) || b.is_subset(a),
                    "decisions must be pairwise comparable: {:?} vs {:?}",
                    a,
                    b
                );
            }
        }
    }
}

// ---------------------------------------------------------------------
// the link over real sockets

#[test]
fn link_delivers_everything_exactly_once() {
    let receiver = PerfectLink::new(1);
    let addr = receiver.bind(localhost(0)).unwrap();
    let senders = [PerfectLink::new(2), PerfectLink::new(3)];
    for sender in &senders {
        sender.bind(localhost(0)).unwrap();
    }

    let got: Mutex<Vec<(ProcessId, u32)>> = Mutex::new(Vec::new());
    let complete = thread::scope(|s| {
        s.spawn(|| {
            let _ = receiver.listen(|sender, _metadata, payloads| {
                let mut word = [0u8; 4];
                word.copy_from_slice(&payloads[0][..4]);
                got.lock().push((sender, u32::from_le_bytes(word)));
            });
        });
        // Senders run listeners too: that is where their ACKs are
        // processed and their in-flight permits come back.
        for sender in &senders {
            s.spawn(move || {
                let _ = sender.listen(|_, _, _| {});
            });
        }

        for sender in &senders {
            for n in 1u32..=100 {
                sender.send(addr, None, &[&n.to_le_bytes()]).unwrap();
            }
        }

        let complete = wait_until(Duration::from_secs(10), || got.lock().len() >= 200);
        receiver.shutdown();
        for sender in &senders {
            sender.shutdown();
        }
        complete
    });

    assert!(complete, "not all messages were delivered");
    let got = got.lock();
    assert_eq!(got.len(), 200, "no message may be delivered twice");
    let distinct: BTreeSet<&(ProcessId, u32)> = got.iter().collect();
    assert_eq!(distinct.len(), 200);
    for sender_id in [2, 3] {
        for n in 1u32..=100 {
            assert!(distinct.contains(&(sender_id, n)));
        }
    }
}

#[test]
fn replayed_datagrams_are_delivered_once_and_acked_every_time() {
    let link = PerfectLink::new(1);
    let addr = link.bind(localhost(0)).unwrap();

    let deliveries: Mutex<Vec<(ProcessId, Vec<u8>)>> = Mutex::new(Vec::new());
    thread::scope(|s| {
        s.spawn(|| {
            let _ = link.listen(|sender, _metadata, payloads| {
                deliveries.lock().push((sender, payloads[0].to_vec()));
            });
        });

        let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
        raw.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let frame = codec::encode(false, 7, 42, None, &[b"hello"]).unwrap();
        for _ in 0..3 {
            raw.send_to(&frame, addr).unwrap();
        }

        // Every copy is acknowledged, mirrored sequence number and all,
        // or the sender could retry forever.
        let mut acks = 0;
        let mut buf = [0u8; 64];
        while let Ok((len, _)) = raw.recv_from(&mut buf) {
            let ack = codec::decode(&buf[..len]).unwrap();
            assert!(ack.is_ack);
            assert_eq!(ack.seq_nr, 7);
            assert_eq!(ack.sender_id, 1);
            acks += 1;
            if acks == 3 {
                break;
            }
        }
        assert_eq!(acks, 3);
        link.shutdown();
    });

    let deliveries = deliveries.lock();
    assert_eq!(deliveries.len(), 1, "replays must not be re-delivered");
    assert_eq!(deliveries[0], (42, b"hello".to_vec()));
}

#[test]
fn link_retransmits_through_a_lossy_path() {
    let receiver = PerfectLink::new(1);
    let recv_addr = receiver.bind(localhost(0)).unwrap();
    let sender = PerfectLink::new(2);
    let send_addr = sender.bind(localhost(0)).unwrap();

    // A middlebox that forwards datagrams between the two links and drops
    // every third one, in both directions. The timeout-driven resends must
    // push everything through anyway.
    let middle = UdpSocket::bind("127.0.0.1:0").unwrap();
    middle
        .set_read_timeout(Some(Duration::from_millis(50)))
        .unwrap();
    let middle_addr = match middle.local_addr().unwrap() {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => unreachable!(),
    };
    let middle_done = std::sync::atomic::AtomicBool::new(false);

    let got: Mutex<BTreeSet<u32>> = Mutex::new(BTreeSet::new());
    let complete = thread::scope(|s| {
        s.spawn(|| {
            let mut buf = [0u8; 2048];
            let mut counter = 0u32;
            while !middle_done.load(std::sync::atomic::Ordering::Relaxed) {
                let (len, src) = match middle.recv_from(&mut buf) {
                    Ok(received) => received,
                    Err(_) => continue,
                };
                counter += 1;
                if counter % 3 == 0 {
                    continue;
                }
                let forward_to = if src == SocketAddr::V4(send_addr) {
                    recv_addr
                } else {
                    send_addr
                };
                let _ = middle.send_to(&buf[..len], forward_to);
            }
        });
        s.spawn(|| {
            let _ = receiver.listen(|_sender, _metadata, payloads| {
                let mut word = [0u8; 4];
                word.copy_from_slice(&payloads[0][..4]);
                got.lock().insert(u32::from_le_bytes(word));
            });
        });
        s.spawn(|| {
            let _ = sender.listen(|_, _, _| {});
        });

        for n in 1u32..=50 {
            sender.send(middle_addr, None, &[&n.to_le_bytes()]).unwrap();
        }

        let complete = wait_until(Duration::from_secs(20), || got.lock().len() == 50);
        middle_done.store(true, std::sync::atomic::Ordering::Relaxed);
        receiver.shutdown();
        sender.shutdown();
        complete
    });

    assert!(complete, "losses must be repaired by retransmission");
    assert_eq!(*got.lock(), (1..=50).collect::<BTreeSet<u32>>());
}

#[test]
fn link_refuses_double_bind_and_unbound_send() {
    let link = PerfectLink::new(1);
    assert!(matches!(
        link.send(localhost(9), None, &[b"x"]),
        Err(LinkError::NotBound)
    ));
    link.bind(localhost(0)).unwrap();
    assert!(matches!(link.bind(localhost(0)), Err(LinkError::AlreadyBound)));
}

// ---------------------------------------------------------------------
// broadcast layers over real sockets

#[test]
fn uniform_broadcast_survives_a_stopped_origin() {
    let addrs = reserve_addrs(3);
    let processes: HashMap<ProcessId, SocketAddrV4> = (1u8..=3).zip(addrs).collect();
    let links: Vec<UniformReliableBroadcast> = (1u8..=3)
        .map(|id| UniformReliableBroadcast::new(id, processes.clone()))
        .collect();
    for link in &links {
        link.bind(processes[&link.id()]).unwrap();
    }

    let delivered: Vec<Mutex<Vec<(ProcessId, u32)>>> =
        (0..3).map(|_| Mutex::new(Vec::new())).collect();

    let complete = thread::scope(|s| {
        for (link, log) in links.iter().zip(&delivered) {
            s.spawn(move || {
                let _ = link.listen(|origin, seq_nr, _payloads| {
                    log.lock().push((origin, seq_nr));
                });
            });
        }

        // The origin gets its message onto the wire once, then stops
        // participating: no relays, no acknowledgements, nothing. The
        // survivors must still converge on delivering it.
        links[0].broadcast(&[b"doomed"]).unwrap();
        links[0].shutdown();

        let complete = wait_until(Duration::from_secs(10), || {
            delivered[1].lock().contains(&(1, 1)) && delivered[2].lock().contains(&(1, 1))
        });
        for link in &links {
            link.shutdown();
        }
        complete
    });

    assert!(complete, "survivors failed to deliver the stopped origin's broadcast");
}

#[test]
fn fifo_broadcast_orders_each_origin() {
    let addrs = reserve_addrs(3);
    let processes: HashMap<ProcessId, SocketAddrV4> = (1u8..=3).zip(addrs).collect();
    let links: Vec<FifoBroadcast> = (1u8..=3)
        .map(|id| FifoBroadcast::new(id, processes.clone()))
        .collect();
    for link in &links {
        link.bind(processes[&link.id()]).unwrap();
    }

    const MESSAGES: u32 = 10;
    let delivered: Vec<Mutex<Vec<(ProcessId, u32)>>> =
        (0..3).map(|_| Mutex::new(Vec::new())).collect();

    let complete = thread::scope(|s| {
        for (link, log) in links.iter().zip(&delivered) {
            s.spawn(move || {
                let _ = link.listen(|origin, value| log.lock().push((origin, value)));
            });
        }
        for link in &links {
            s.spawn(move || {
                for n in 1..=MESSAGES {
                    link.broadcast(n).unwrap();
                }
            });
        }

        let complete = wait_until(Duration::from_secs(15), || {
            delivered
                .iter()
                .all(|log| log.lock().len() as u32 == 3 * MESSAGES)
        });
        for link in &links {
            link.shutdown();
        }
        complete
    });

    assert!(complete, "not every process delivered every broadcast");
    for log in &delivered {
        let log = log.lock();
        for origin in 1u8..=3 {
            let values: Vec<u32> = log
                .iter()
                .filter(|(from, _)| *from == origin)
                .map(|(_, v)| *v)
                .collect();
            assert_eq!(
                values,
                (1..=MESSAGES).collect::<Vec<u32>>(),
                "origin {}'s messages must arrive in broadcast order",
                origin
            );
        }
    }
}

#[test]
fn lattice_agreement_decides_comparable_sets_over_sockets() {
    let addrs = reserve_addrs(3);
    let processes: HashMap<ProcessId, SocketAddrV4> = (1u8..=3).zip(addrs).collect();
    let links: Vec<LatticeAgreement> = (1u8..=3)
        .map(|id| LatticeAgreement::new(id, processes.clone(), 3))
        .collect();
    for link in &links {
        link.bind(processes[&link.id()]).unwrap();
    }

    // Two agreements per process, proposed back to back: the second
    // proposal must wait for the first decision.
    let proposals: Vec<Vec<BTreeSet<u32>>> = vec![
        vec![BTreeSet::from([1]), BTreeSet::from([10, 11])],
        vec![BTreeSet::from([2]), BTreeSet::from([12])],
        vec![BTreeSet::from([1, 2]), BTreeSet::from([11, 12])],
    ];
    let decisions: Vec<Mutex<Vec<BTreeSet<u32>>>> =
        (0..3).map(|_| Mutex::new(Vec::new())).collect();

    let complete = thread::scope(|s| {
        for (link, log) in links.iter().zip(&decisions) {
            s.spawn(move || {
                let _ = link.listen(|decided| log.lock().push(decided.clone()));
            });
        }
        for (link, mine) in links.iter().zip(&proposals) {
            s.spawn(move || {
                for values in mine {
                    link.propose(values.clone()).unwrap();
                }
            });
        }

        let complete = wait_until(Duration::from_secs(15), || {
            decisions.iter().all(|log| log.lock().len() == 2)
        });
        for link in &links {
            link.shutdown();
        }
        complete
    });

    assert!(complete, "not every process decided every agreement");
    for agreement in 0..2 {
        let union: BTreeSet<u32> = proposals
            .iter()
            .flat_map(|p| p[agreement].clone())
            .collect();
        let decided: Vec<BTreeSet<u32>> = decisions
            .iter()
            .map(|log| log.lock()[agreement].clone())
            .collect();
        for (process, set) in decided.iter().enumerate() {
            assert!(
                proposals[process][agreement].is_subset(set),
                "a decision must contain the proposer's own values"
            );
            assert!(set.is_subset(&union));
        }
        for a in &decided {
            for b in &decided {
                assert!(a.is_subset(b) || b.is_subset(a));
            }
        }
    }
}
