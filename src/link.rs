// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * The perfect link: reliable point-to-point delivery over UDP.
 *
 * Three properties hold between any pair of correct processes:
 *
 *   1. Validity -- every message sent is eventually delivered.
 *   2. No duplication -- no message is delivered more than once.
 *   3. No creation -- nothing is delivered that was not sent.
 *
 * The machinery is deliberately plain. Each outgoing message gets the
 * link's next sequence number and sits in a pending map until the receiver
 * acknowledges that number. The single listener thread drives everything
 * else off one blocking socket: it delivers fresh messages (deduplicating
 * on `(sender_id, seq_nr)`), mirrors an ACK for every data packet it sees,
 * removes pending entries when ACKs come back, and on each receive timeout
 * re-sends every entry still pending. Retries are unbounded; a crashed
 * peer simply never acknowledges and its entries stay put.
 *
 * Sequence numbers are per-link, not per-remote, so two receivers may see
 * the same number from one sender. Deduplication keys on the sender id as
 * well, which is sound because each process owns its own counter.
 *
 * Back-pressure: a sender blocks once [`MAX_IN_FLIGHT`] messages are
 * unacknowledged, and resumes as ACKs drain the pending map. The network
 * itself is never throttled beyond this cap.
 */

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{trace, warn};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use thiserror::Error;

use crate::codec::{self, CodecError};
use crate::semaphore::Semaphore;
use crate::ProcessId;

/// How long the listener waits for a packet before re-sending everything
/// still unacknowledged. This is the only clock in the protocol.
pub const RESEND_TIMEOUT: Duration = Duration::from_millis(200);

/// Cap on unacknowledged messages per link.
pub const MAX_IN_FLIGHT: usize = 64;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link is already bound")]
    AlreadyBound,

    #[error("link must be bound first")]
    NotBound,

    #[error("no process with id {0} in the group")]
    UnknownProcess(ProcessId),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A message sent but not yet acknowledged, keyed by its sequence number.
struct Pending {
    dest: SocketAddrV4,
    frame: Arc<Vec<u8>>,
}

/// Sequence allocation and the pending map share one lock: a number is
/// never handed out without its entry.
struct Outbound {
    next_seq_nr: u32,
    pending: HashMap<u32, Pending>,
}

pub struct PerfectLink {
    id: ProcessId,
    sock: OnceCell<UdpSocket>,
    outbound: Mutex<Outbound>,
    delivered: Mutex<HashSet<u64>>,
    in_flight: Semaphore,
    done: AtomicBool,
}

/// `(sender_id, seq_nr)` packed into one word for the delivered set.
fn delivery_key(sender_id: ProcessId, seq_nr: u32) -> u64 {
    (u64::from(sender_id) << 32) | u64::from(seq_nr)
}

/// Send errors that mean the peer is gone, not that we are broken. Under
/// crash-stop the message is either already delivered or permanently
/// undeliverable, so these are ignored. Linux also reports a dead UDP peer
/// as a connection error after an ICMP port-unreachable.
fn peer_unreachable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
    )
}

impl PerfectLink {
    pub fn new(id: ProcessId) -> Self {
        PerfectLink {
            id,
            sock: OnceCell::new(),
            outbound: Mutex::new(Outbound {
                next_seq_nr: 1,
                pending: HashMap::new(),
            }),
            delivered: Mutex::new(HashSet::new()),
            in_flight: Semaphore::new(MAX_IN_FLIGHT),
            done: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Binds the link's socket. A link binds exactly once; the socket's
    /// receive timeout is what paces retransmission. Returns the bound
    /// address, which is the useful part when binding port 0.
    pub fn bind(&self, addr: SocketAddrV4) -> Result<SocketAddrV4, LinkError> {
        if self.sock.get().is_some() {
            return Err(LinkError::AlreadyBound);
        }
        let sock = UdpSocket::bind(addr)?;
        sock.set_read_timeout(Some(RESEND_TIMEOUT))?;
        let local = match sock.local_addr()? {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => {
                return Err(LinkError::Io(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "bound a non-IPv4 socket",
                )))
            }
        };
        self.sock
            .set(sock)
            .map_err(|_| LinkError::AlreadyBound)?;
        Ok(local)
    }

    /// Sends `payloads` (plus optional metadata) to one destination.
    ///
    /// Blocks while [`MAX_IN_FLIGHT`] messages are unacknowledged. On
    /// return the message has been queued to the kernel at least once and
    /// recorded as pending; the listener takes it from there.
    pub fn send(
        &self,
        dest: SocketAddrV4,
        metadata: Option<&[u8]>,
        payloads: &[&[u8]],
    ) -> Result<(), LinkError> {
        let sock = self.sock.get().ok_or(LinkError::NotBound)?;
        // Encode with a placeholder first: a frame that cannot be encoded
        // must not burn a permit or a sequence number.
        let mut frame = codec::encode(false, 0, self.id, metadata, payloads)?;

        self.in_flight.acquire();
        let frame = {
            let mut outbound = self.outbound.lock();
            let seq_nr = outbound.next_seq_nr;
            outbound.next_seq_nr += 1;
            codec::patch_seq_nr(&mut frame, seq_nr);
            let frame = Arc::new(frame);
            outbound.pending.insert(
                seq_nr,
                Pending {
                    dest,
                    frame: Arc::clone(&frame),
                },
            );
            frame
        };
        send_raw(sock, &frame, dest)?;
        Ok(())
    }

    /// Runs the receive loop until [`shutdown`](Self::shutdown).
    ///
    /// `deliver` is invoked once per fresh message with the sender id, the
    /// metadata slice and the payload slices, all borrowed from the
    /// receive buffer. One listener per link; sends may happen from any
    /// thread concurrently.
    pub fn listen<F>(&self, mut deliver: F) -> Result<(), LinkError>
    where
        F: FnMut(ProcessId, &[u8], &[&[u8]]),
    {
        let sock = self.sock.get().ok_or(LinkError::NotBound)?;
        let mut buf = vec![0u8; codec::MAX_MESSAGE_SIZE];

        while !self.done.load(Ordering::Relaxed) {
            let (len, src) = match sock.recv_from(&mut buf) {
                Ok(received) => received,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    self.resend_pending(sock)?;
                    continue;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if peer_unreachable(&err) => continue,
                Err(err) => return Err(LinkError::Io(err)),
            };

            let frame = match codec::decode(&buf[..len]) {
                Ok(frame) => frame,
                Err(err) => {
                    debug_assert!(false, "undecodable datagram from {}: {}", src, err);
                    warn!("dropping undecodable datagram from {}: {}", src, err);
                    continue;
                }
            };

            if frame.is_ack {
                let acked = self.outbound.lock().pending.remove(&frame.seq_nr).is_some();
                if acked {
                    trace!("ack for #{}", frame.seq_nr);
                    self.in_flight.release();
                }
                continue;
            }

            // Always acknowledge, even a duplicate: the first ACK may have
            // been lost. The ACK mirrors the sequence number and carries
            // nothing else.
            let src = match src {
                SocketAddr::V4(v4) => v4,
                SocketAddr::V6(_) => {
                    debug_assert!(false, "received from a non-IPv4 peer {}", src);
                    warn!("dropping datagram from non-IPv4 peer {}", src);
                    continue;
                }
            };

            let ack = codec::encode(true, frame.seq_nr, self.id, None, &[])?;
            send_raw(sock, &ack, src)?;

            let fresh = self
                .delivered
                .lock()
                .insert(delivery_key(frame.sender_id, frame.seq_nr));
            if fresh {
                deliver(frame.sender_id, frame.metadata, frame.payloads.as_slice());
            } else {
                trace!("duplicate #{} from {}", frame.seq_nr, frame.sender_id);
            }
        }
        Ok(())
    }

    /// Makes the listener return after its current timeout tick.
    pub fn shutdown(&self) {
        self.done.store(true, Ordering::Relaxed);
    }

    /// Re-sends every unacknowledged message to its original destination.
    /// The pending map is snapshotted first so no lock is held across
    /// `sendto`; an entry acknowledged mid-snapshot is re-sent once more,
    /// which the receiver's dedup absorbs.
    fn resend_pending(&self, sock: &UdpSocket) -> Result<(), LinkError> {
        let snapshot: Vec<(SocketAddrV4, Arc<Vec<u8>>)> = {
            let outbound = self.outbound.lock();
            outbound
                .pending
                .values()
                .map(|p| (p.dest, Arc::clone(&p.frame)))
                .collect()
        };
        if !snapshot.is_empty() {
            trace!("resending {} unacknowledged messages", snapshot.len());
        }
        for (dest, frame) in snapshot {
            send_raw(sock, &frame, dest)?;
        }
        Ok(())
    }
}

fn send_raw(sock: &UdpSocket, frame: &[u8], dest: SocketAddrV4) -> Result<(), LinkError> {
    loop {
        match sock.send_to(frame, dest) {
            Ok(_) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) if peer_unreachable(&err) => return Ok(()),
            Err(err) => return Err(LinkError::Io(err)),
        }
    }
}
