//! Reliable delivery of short active messages.
//!
//! One background I/O thread per process owns a ring of posted eager
//! receives and dispatches arriving messages to registered handlers.
//! Messages carry a 16-byte header; senders may request per-peer FIFO
//! ordering, enforced with 16-bit sequence stamps and a bounded
//! out-of-order queue on the receiving side. Payloads larger than the eager
//! buffer go through a rendezvous: a control record reserves an exactly
//! sized buffer at the destination, which acknowledges before the data
//! moves on its own tag.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;

use crate::comm::{Message, SendHandle, Transport};
use crate::constants::{
    ALIGNMENT, DEFAULT_MAX_MSG_LEN, DEFAULT_NRECV, ENV_BUFFER_SIZE, ENV_RECV_BUFFERS,
    RMI_HUGE_ACK_TAG, RMI_HUGE_DAT_TAG, RMI_TAG,
};
use crate::pmap::Rank;

/// Index into the process-wide handler table.
pub type HandlerId = u16;

/// Reserved handler id for the huge-message control record; intercepted by
/// the I/O thread and never dispatched to user code.
pub const HUGE_HANDLER: HandlerId = 0;

/// Attribute bit requesting per-peer FIFO delivery.
pub const ATTR_ORDERED: u32 = 1;

/// Attribute word for unordered delivery.
pub const ATTR_UNORDERED: u32 = 0;

fn is_ordered(attr: u32) -> bool {
    attr & ATTR_ORDERED != 0
}

fn seq_of(attr: u32) -> u16 {
    (attr >> 16) as u16
}

/// All multi-byte header fields are little-endian on the wire.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct MsgHeader {
    handler_le: u16,
    reserved_le: u16,
    attr_le: u32,
    nbyte_le: u64,
}

/// Header length in bytes; every eager message is at least this long.
pub const HEADER_LEN: usize = std::mem::size_of::<MsgHeader>();

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct HugeControl {
    src_le: u64,
    nbyte_le: u64,
}

/// A message as seen by a handler.
pub struct RmiMessage {
    /// Sending rank.
    pub src: Rank,
    /// Attribute word as stamped by the sender.
    pub attr: u32,
    /// Payload after the header.
    pub payload: Vec<u8>,
}

/// Handler invoked on the I/O thread; must be short and non-blocking.
pub type Handler = Arc<dyn Fn(RmiMessage) + Send + Sync>;

/// Buffer sizing for the messaging layer.
#[derive(Clone, Copy, Debug)]
pub struct RmiConfig {
    /// Size of each posted eager buffer, rounded up to `ALIGNMENT`.
    pub max_msg_len: usize,
    /// Number of posted eager buffers, at least `DEFAULT_NRECV`.
    pub nrecv: usize,
}

impl Default for RmiConfig {
    fn default() -> Self {
        Self {
            max_msg_len: DEFAULT_MAX_MSG_LEN,
            nrecv: DEFAULT_NRECV,
        }
    }
}

impl RmiConfig {
    /// Configuration from the environment, falling back to the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(ENV_BUFFER_SIZE) {
            if let Some(bytes) = parse_memory(&raw) {
                if bytes < 1024 {
                    tracing::warn!(
                        "{} must be at least 1024 bytes; using default",
                        ENV_BUFFER_SIZE
                    );
                } else {
                    config.max_msg_len = bytes;
                }
            }
        }
        if let Ok(raw) = std::env::var(ENV_RECV_BUFFERS) {
            if let Ok(n) = raw.trim().parse::<usize>() {
                if n < DEFAULT_NRECV {
                    tracing::warn!(
                        "{} must be at least {}; raising",
                        ENV_RECV_BUFFERS,
                        DEFAULT_NRECV
                    );
                    config.nrecv = DEFAULT_NRECV;
                } else {
                    config.nrecv = n;
                }
            }
        }
        config.max_msg_len = round_up(config.max_msg_len, ALIGNMENT);
        config
    }

    /// Explicit configuration, clamped to the floors.
    pub fn with(max_msg_len: usize, nrecv: usize) -> Self {
        Self {
            max_msg_len: round_up(max_msg_len.max(1024), ALIGNMENT),
            nrecv: nrecv.max(DEFAULT_NRECV),
        }
    }
}

fn round_up(n: usize, align: usize) -> usize {
    n.div_ceil(align) * align
}

fn parse_memory(raw: &str) -> Option<usize> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(raw.len());
    let value: f64 = raw[..split].parse().ok()?;
    let unit = raw[split..].trim();
    let scale = match unit {
        "" => 1.0,
        "KB" | "kB" => 1024.0,
        "MB" => 1024.0 * 1024.0,
        "GB" => 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };
    Some((value * scale) as usize)
}

/// Message counters, readable at any time.
#[derive(Debug, Default)]
pub struct RmiStats {
    nmsg_sent: AtomicU64,
    nbyte_sent: AtomicU64,
    nmsg_recv: AtomicU64,
    nbyte_recv: AtomicU64,
    nhuge_sent: AtomicU64,
    nhuge_recv: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RmiStatsSnapshot {
    /// Messages sent.
    pub nmsg_sent: u64,
    /// Bytes sent.
    pub nbyte_sent: u64,
    /// Messages received.
    pub nmsg_recv: u64,
    /// Bytes received.
    pub nbyte_recv: u64,
    /// Rendezvous payloads sent on the huge-data tag.
    pub nhuge_sent: u64,
    /// Rendezvous payloads received on the huge-data tag.
    pub nhuge_recv: u64,
}

impl RmiStats {
    fn snapshot(&self) -> RmiStatsSnapshot {
        RmiStatsSnapshot {
            nmsg_sent: self.nmsg_sent.load(Ordering::Acquire),
            nbyte_sent: self.nbyte_sent.load(Ordering::Acquire),
            nmsg_recv: self.nmsg_recv.load(Ordering::Acquire),
            nbyte_recv: self.nbyte_recv.load(Ordering::Acquire),
            nhuge_sent: self.nhuge_sent.load(Ordering::Acquire),
            nhuge_recv: self.nhuge_recv.load(Ordering::Acquire),
        }
    }
}

struct SendState {
    counters: Vec<u16>,
    inflight: Vec<Box<dyn SendHandle>>,
}

struct Shared {
    comm: Arc<dyn Transport>,
    config: RmiConfig,
    handlers: Vec<Handler>,
    stats: RmiStats,
    finished: AtomicBool,
    send: Mutex<SendState>,
}

/// The reliable messaging layer of one process.
pub struct Rmi {
    shared: Arc<Shared>,
    io: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Rmi {
    /// Start the layer. `handlers[0]` is reserved for the huge-message
    /// control record and never called. With a single rank no I/O thread is
    /// spawned.
    pub fn new(comm: Arc<dyn Transport>, handlers: Vec<Handler>, config: RmiConfig) -> Self {
        let shared = Arc::new(Shared {
            send: Mutex::new(SendState {
                counters: vec![0; comm.size()],
                inflight: Vec::new(),
            }),
            comm,
            config,
            handlers,
            stats: RmiStats::default(),
            finished: AtomicBool::new(false),
        });
        let io = if shared.comm.size() > 1 {
            let s = shared.clone();
            Some(
                thread::Builder::new()
                    .name("mw-rmi".to_string())
                    .spawn(move || io_loop(s))
                    .expect("failed to spawn RMI thread"),
            )
        } else {
            None
        };
        Self {
            shared,
            io: Mutex::new(io),
        }
    }

    /// Number of ranks.
    pub fn size(&self) -> usize {
        self.shared.comm.size()
    }

    /// Rank of this process.
    pub fn rank(&self) -> Rank {
        self.shared.comm.rank()
    }

    /// Current counters.
    pub fn stats(&self) -> RmiStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// One-way send of `(handler, attr, payload)` to `dest`.
    ///
    /// Ordered sends to the same destination are delivered in send order.
    /// Payloads that do not fit an eager buffer take the rendezvous path,
    /// which blocks the caller until the destination has posted a buffer.
    pub fn isend(&self, dest: Rank, handler: HandlerId, attr: u32, payload: &[u8]) {
        let shared = &self.shared;
        assert_ne!(
            dest,
            shared.comm.rank(),
            "RMI send to self; local calls bypass the messaging layer"
        );
        assert!((handler as usize) < shared.handlers.len(), "unknown handler");

        let nbyte = HEADER_LEN + payload.len();
        let tag = if nbyte > shared.config.max_msg_len {
            // Rendezvous: reserve a buffer at the destination and wait for
            // its acknowledgement before shipping the payload.
            let mut ack = shared.comm.irecv(Some(dest), RMI_HUGE_ACK_TAG, 0);
            let control = HugeControl {
                src_le: (shared.comm.rank() as u64).to_le(),
                nbyte_le: (nbyte as u64).to_le(),
            };
            self.isend(dest, HUGE_HANDLER, ATTR_UNORDERED, bytemuck::bytes_of(&control));
            let mut waiter = SpinWaiter::default();
            loop {
                if ack.test().is_some() {
                    break;
                }
                waiter.wait();
            }
            shared.stats.nhuge_sent.fetch_add(1, Ordering::AcqRel);
            RMI_HUGE_DAT_TAG
        } else {
            RMI_TAG
        };

        // One lock covers the sequence stamp and the transport submission;
        // releasing in between would let a second sender overtake the
        // stamped order.
        let mut send = shared.send.lock();
        let mut attr = attr;
        if is_ordered(attr) {
            attr |= (send.counters[dest] as u32) << 16;
            send.counters[dest] = send.counters[dest].wrapping_add(1);
        }
        let header = MsgHeader {
            handler_le: handler.to_le(),
            reserved_le: 0,
            attr_le: attr.to_le(),
            nbyte_le: (nbyte as u64).to_le(),
        };
        let mut bytes = Vec::with_capacity(nbyte);
        bytes.extend_from_slice(bytemuck::bytes_of(&header));
        bytes.extend_from_slice(payload);
        shared.stats.nmsg_sent.fetch_add(1, Ordering::AcqRel);
        shared
            .stats
            .nbyte_sent
            .fetch_add(nbyte as u64, Ordering::AcqRel);
        let handle = shared.comm.isend(dest, tag, &bytes);
        send.inflight.push(handle);
        send.inflight.retain_mut(|h| !h.test());
    }

    /// Signal the I/O thread to exit and wait for it.
    pub fn end(&self) {
        self.shared.finished.store(true, Ordering::Release);
        thread::sleep(Duration::from_millis(10));
        if let Some(handle) = self.io.lock().take() {
            let _ = handle.join();
        }
        let mut send = self.shared.send.lock();
        for mut handle in send.inflight.drain(..) {
            handle.wait();
        }
    }
}

impl Drop for Rmi {
    fn drop(&mut self) {
        self.end();
    }
}

/// Bounded exponential backoff for the few spin points in the layer.
#[derive(Default)]
struct SpinWaiter {
    count: u32,
}

impl SpinWaiter {
    fn wait(&mut self) {
        self.count += 1;
        if self.count < 100 {
            std::hint::spin_loop();
        } else if self.count < 1000 {
            thread::yield_now();
        } else {
            thread::sleep(Duration::from_micros(50));
        }
    }

    fn reset(&mut self) {
        self.count = 0;
    }
}

struct QMsg {
    seq: u16,
    src: Rank,
    attr: u32,
    handler: HandlerId,
    payload: Vec<u8>,
}

struct IoState {
    shared: Arc<Shared>,
    recv_counters: Vec<u16>,
    parked: Vec<QMsg>,
    maxq: usize,
    hugeq: VecDeque<(Rank, usize)>,
    huge_slot: Option<Box<dyn crate::comm::RecvHandle>>,
    ack_inflight: Vec<Box<dyn SendHandle>>,
}

impl IoState {
    /// Run the handler, counting the message only afterwards so that the
    /// fence's termination detection cannot observe a received message
    /// whose follow-on tasks are not yet queued.
    fn dispatch(&self, handler: HandlerId, src: Rank, attr: u32, payload: Vec<u8>) {
        let nbyte = (HEADER_LEN + payload.len()) as u64;
        let f = &self.shared.handlers[handler as usize];
        f(RmiMessage { src, attr, payload });
        self.shared.stats.nmsg_recv.fetch_add(1, Ordering::AcqRel);
        self.shared
            .stats
            .nbyte_recv
            .fetch_add(nbyte, Ordering::AcqRel);
    }

    /// Decode one arrived buffer and either dispatch it, park it, or feed
    /// the huge queue.
    fn process(&mut self, msg: Message) {
        let header: MsgHeader = bytemuck::pod_read_unaligned(&msg.data[..HEADER_LEN]);
        let handler = u16::from_le(header.handler_le);
        let attr = u32::from_le(header.attr_le);
        let nbyte = u64::from_le(header.nbyte_le) as usize;
        let payload = msg.data[HEADER_LEN..nbyte].to_vec();

        if handler == HUGE_HANDLER {
            let control: HugeControl = bytemuck::pod_read_unaligned(&payload);
            let src = u64::from_le(control.src_le) as Rank;
            let huge_nbyte = u64::from_le(control.nbyte_le) as usize;
            tracing::trace!(src, huge_nbyte, "huge message announced");
            self.hugeq.push_back((src, huge_nbyte));
            self.shared.stats.nmsg_recv.fetch_add(1, Ordering::AcqRel);
            self.shared
                .stats
                .nbyte_recv
                .fetch_add(nbyte as u64, Ordering::AcqRel);
            return;
        }

        let seq = seq_of(attr);
        if !is_ordered(attr) || seq == self.recv_counters[msg.src] {
            if is_ordered(attr) {
                self.recv_counters[msg.src] = self.recv_counters[msg.src].wrapping_add(1);
            }
            self.dispatch(handler, msg.src, attr, payload);
        } else {
            if self.parked.len() >= self.maxq {
                tracing::error!("out-of-order message queue overflowed");
                std::process::abort();
            }
            self.parked.push(QMsg {
                seq,
                src: msg.src,
                attr,
                handler,
                payload,
            });
        }
    }

    /// Sort the parked messages by stamped sequence and dispatch as many as
    /// are now in order; one pass suffices after the sort.
    fn drain_parked(&mut self) {
        self.parked.sort_by_key(|m| m.seq);
        let mut leftover = Vec::with_capacity(self.parked.len());
        for m in std::mem::take(&mut self.parked) {
            if m.seq == self.recv_counters[m.src] {
                self.recv_counters[m.src] = self.recv_counters[m.src].wrapping_add(1);
                self.dispatch(m.handler, m.src, m.attr, m.payload);
            } else {
                leftover.push(m);
            }
        }
        self.parked = leftover;
    }

    /// If the rendezvous slot is free and a request is pending, post the
    /// exactly sized receive and acknowledge the sender.
    fn post_pending_huge(&mut self) {
        if self.huge_slot.is_some() {
            return;
        }
        if let Some((src, nbyte)) = self.hugeq.pop_front() {
            self.huge_slot = Some(self.shared.comm.irecv(Some(src), RMI_HUGE_DAT_TAG, nbyte));
            let ack = self.shared.comm.isend(src, RMI_HUGE_ACK_TAG, &[]);
            self.ack_inflight.push(ack);
            self.ack_inflight.retain_mut(|h| !h.test());
        }
    }
}

fn io_loop(shared: Arc<Shared>) {
    let nrecv = shared.config.nrecv;
    let max_msg_len = shared.config.max_msg_len;
    let comm = shared.comm.clone();
    let mut slots: Vec<Box<dyn crate::comm::RecvHandle>> = (0..nrecv)
        .map(|_| comm.irecv(None, RMI_TAG, max_msg_len))
        .collect();
    let mut state = IoState {
        recv_counters: vec![0; comm.size()],
        parked: Vec::new(),
        maxq: nrecv + 1,
        hugeq: VecDeque::new(),
        huge_slot: None,
        ack_inflight: Vec::new(),
        shared: shared.clone(),
    };
    let mut waiter = SpinWaiter::default();

    loop {
        if shared.finished.load(Ordering::Acquire) {
            return;
        }
        let mut narrived = 0;
        for slot in slots.iter_mut() {
            if let Some(msg) = slot.test() {
                narrived += 1;
                state.process(msg);
                *slot = comm.irecv(None, RMI_TAG, max_msg_len);
            }
        }
        let huge_arrival = state.huge_slot.as_mut().and_then(|huge| huge.test());
        if let Some(msg) = huge_arrival {
            narrived += 1;
            state.huge_slot = None;
            shared.stats.nhuge_recv.fetch_add(1, Ordering::AcqRel);
            state.process(msg);
        }
        if narrived > 0 {
            state.drain_parked();
            state.post_pending_huge();
            waiter.reset();
        } else {
            state.post_pending_huge();
            waiter.wait();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn memory_parsing_understands_suffixes() {
        assert_eq!(parse_memory("4096"), Some(4096));
        assert_eq!(parse_memory("2KB"), Some(2048));
        assert_eq!(parse_memory("1.5 MB"), Some(3 * 512 * 1024));
        assert_eq!(parse_memory("1GB"), Some(1 << 30));
    }

    #[test]
    fn config_rounds_to_alignment() {
        let config = RmiConfig::with(1025, 1);
        assert_eq!(config.max_msg_len % ALIGNMENT, 0);
        assert!(config.max_msg_len >= 1025);
        assert_eq!(config.nrecv, DEFAULT_NRECV);
    }

    #[test]
    fn attribute_word_carries_sequence() {
        let attr = ATTR_ORDERED | (513u32 << 16);
        assert!(is_ordered(attr));
        assert_eq!(seq_of(attr), 513);
        assert!(!is_ordered(ATTR_UNORDERED));
    }
}
