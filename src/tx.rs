//! Tx module: per-port transmit queues, priority arbitration, retransmission
//! on ack timeout, channel blacklist (`spec.md` §4.4).

use crate::app::{ApplicationCallback, ControlMessage};
use crate::clock::{Clock, MonotonicClock};
use crate::codes::S3tpErrorCode;
use crate::codec::WireCodec;
use crate::config::{S3tpConfig, DEFAULT_RESERVED_CHANNEL};
use crate::control::{ControlPacketPayload, ControlPayload, ControlType, SyncPayload};
use crate::error::{Error, Result};
use crate::header::{Flags, Header};
use crate::link::LinkInterface;
use crate::packet::{Packet, PacketOptions};
use crate::queue::{PriorityQueue, QueuePolicy};
use bytes::Bytes;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, instrument, warn};

/// Scheduler state (`spec.md` §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Running,
    Blocked,
    Waiting,
}

/// FIFO-by-enqueue-order policy for the control queue — demonstrates the
/// generic `PriorityQueue` instantiated with a different policy than the
/// rx reorder buffer's window-gated one, per `spec.md` §9's design note.
struct ControlFifoPolicy;

/// Wraps a control `Packet` with a monotonic enqueue-order tiebreaker so the
/// generic comparator has something stable to sort on.
#[derive(Clone)]
struct Sequenced<T> {
    seq: u64,
    value: T,
}

impl QueuePolicy<Sequenced<Packet>> for ControlFifoPolicy {
    fn compare(&self, a: &Sequenced<Packet>, b: &Sequenced<Packet>) -> Ordering {
        a.seq.cmp(&b.seq)
    }
    fn is_valid(&self, _elem: &Sequenced<Packet>) -> bool {
        true
    }
    fn window_exceeded(&self, _head: &Sequenced<Packet>, _new_elem: &Sequenced<Packet>) -> bool {
        false
    }
}

struct RetransmissionSlot {
    frame: Bytes,
    channel: u8,
    global_seq: u8,
    started_at: Instant,
    retransmission_count: u8,
}

struct TxInner {
    port_queues: HashMap<u8, VecDeque<Packet>>,
    port_channel: HashMap<u8, u8>,
    round_robin_cursor: u8,
    state: TxState,
    /// Sequence space for DATA packets only — this is what the peer's
    /// reorder-buffer anchor tracks, so CTRL packets must never consume a
    /// slot in it (they bypass reassembly entirely on the receive side).
    data_seq_counter: u8,
    /// Separate sequence space for CTRL packets' header `global_seq` field.
    /// Not reorder-tracked by the peer; exists only to keep each control
    /// frame's wire bytes distinguishable for logging/debugging.
    ctrl_seq_counter: u8,
    port_seq_counters: HashMap<u8, u8>,
    retransmission_slot: Option<RetransmissionSlot>,
    channel_blacklist: HashSet<u8>,
    link_up: bool,
}

/// Outcome of an ack-timeout check, driven by the engine's tx worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    NoTimerPending,
    NotYetDue,
    Retransmitted,
    Exhausted,
}

pub struct Tx {
    inner: Mutex<TxInner>,
    control_queue: PriorityQueue<Sequenced<Packet>, ControlFifoPolicy>,
    control_seq_counter: AtomicU64,
    pub cond: Notify,
    config: S3tpConfig,
    link: Arc<dyn LinkInterface>,
    app: Arc<dyn ApplicationCallback>,
    clock: Arc<dyn Clock>,
}

impl Tx {
    pub fn new(config: S3tpConfig, link: Arc<dyn LinkInterface>, app: Arc<dyn ApplicationCallback>) -> Self {
        Self::with_clock(config, link, app, Arc::new(MonotonicClock))
    }

    /// As `new`, but with an injectable clock — lets the ack-timeout logic
    /// be driven by a fake clock in tests instead of wall time.
    pub fn with_clock(
        config: S3tpConfig,
        link: Arc<dyn LinkInterface>,
        app: Arc<dyn ApplicationCallback>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Mutex::new(TxInner {
                port_queues: HashMap::new(),
                port_channel: HashMap::new(),
                round_robin_cursor: 0,
                state: TxState::Waiting,
                data_seq_counter: 0,
                ctrl_seq_counter: 0,
                port_seq_counters: HashMap::new(),
                retransmission_slot: None,
                channel_blacklist: HashSet::new(),
                link_up: true,
            }),
            control_queue: PriorityQueue::new(ControlFifoPolicy, config.max_queue_size),
            control_seq_counter: AtomicU64::new(0),
            cond: Notify::new(),
            config,
            link,
            app,
            clock,
        }
    }

    pub async fn state(&self) -> TxState {
        self.inner.lock().await.state
    }

    async fn recompute_state(&self, inner: &mut TxInner) {
        if !inner.link_up {
            inner.state = TxState::Blocked;
            return;
        }
        if inner.retransmission_slot.is_some() {
            inner.state = TxState::Blocked;
            return;
        }
        if !self.control_queue.is_empty().await {
            inner.state = TxState::Running;
            return;
        }
        let any_eligible = inner.port_queues.iter().any(|(port, q)| {
            if q.is_empty() {
                return false;
            }
            let channel = inner.port_channel.get(port).copied().unwrap_or(DEFAULT_RESERVED_CHANNEL);
            !inner.channel_blacklist.contains(&channel)
        });
        inner.state = if any_eligible {
            TxState::Running
        } else if inner.port_queues.values().all(|q| q.is_empty()) {
            TxState::Waiting
        } else {
            TxState::Blocked
        };
    }

    /// Enqueue a data packet for `port` on `channel`, stamping `global_seq`/
    /// `port_seq` under the tx lock (`spec.md` §4.4 "Per-packet assignment").
    #[instrument(skip(self, payload), fields(port, channel, fragment_idx))]
    pub async fn enqueue_data(
        &self,
        port: u8,
        channel: u8,
        payload: Bytes,
        fragment_idx: u8,
        more_fragments: bool,
        options: PacketOptions,
    ) -> Result<()> {
        if payload.len() > self.config.len_s3tp_pdu as usize {
            return Err(Error::protocol("payload exceeds LEN_S3TP_PDU for a single packet"));
        }
        let mut inner = self.inner.lock().await;

        let queue_bytes = inner
            .port_queues
            .get(&port)
            .map(|q| q.len() * std::mem::size_of::<Packet>())
            .unwrap_or(0);
        if queue_bytes + std::mem::size_of::<Packet>() > self.config.max_queue_size {
            return Err(Error::QueueFull);
        }

        let global_seq = inner.data_seq_counter;
        inner.data_seq_counter = inner.data_seq_counter.wrapping_add(1);
        let port_seq_counter = inner.port_seq_counters.entry(port).or_insert(0);
        let port_seq = *port_seq_counter;
        *port_seq_counter = port_seq_counter.wrapping_add(1);

        let header = Header::new_data(
            global_seq,
            fragment_idx,
            port_seq,
            port,
            more_fragments,
            payload.len() as u16,
        )?;
        let pkt = Packet::new(header, payload, channel, options);
        inner.port_channel.insert(port, channel);
        inner.port_queues.entry(port).or_default().push_back(pkt);
        self.recompute_state(&mut inner).await;
        drop(inner);
        self.cond.notify_one();
        Ok(())
    }

    async fn schedule_control(&self, pkt: Packet) {
        let seq = self.control_seq_counter.fetch_add(1, AtomicOrdering::Relaxed);
        // Control packets never hit the memory cap in this implementation —
        // they are small, bounded in count by the handshake state machine.
        let _ = self.control_queue.push(Sequenced { seq, value: pkt }).await;
        let mut inner = self.inner.lock().await;
        self.recompute_state(&mut inner).await;
        drop(inner);
        self.cond.notify_one();
    }

    fn build_control_packet(&self, global_seq: u8, payload: ControlPacketPayload, ack: u16, options: PacketOptions) -> Result<Packet> {
        let bytes = payload.to_bytes();
        let mut header = Header::new_data(global_seq, 0, 0, 0, false, bytes.len() as u16)?;
        header.flags = Flags::CTRL;
        if ack != 0 {
            header = header.with_piggyback_ack(ack);
        }
        Ok(Packet::new(header, Bytes::from(bytes), DEFAULT_RESERVED_CHANNEL, options))
    }

    pub async fn schedule_acknowledgement(&self, seq: u8) {
        let mut inner = self.inner.lock().await;
        let global_seq = inner.ctrl_seq_counter;
        inner.ctrl_seq_counter = inner.ctrl_seq_counter.wrapping_add(1);
        drop(inner);
        let header_result = Header::new_data(global_seq, 0, 0, 0, false, 0)
            .map(|h| h.flags(Flags::ACK).with_piggyback_ack(seq as u16));
        if let Ok(header) = header_result {
            let pkt = Packet::new(header, Bytes::new(), DEFAULT_RESERVED_CHANNEL, PacketOptions::empty());
            self.schedule_control(pkt).await;
        }
    }

    pub async fn schedule_setup(&self, ack: bool) {
        let mut inner = self.inner.lock().await;
        let global_seq = inner.ctrl_seq_counter;
        inner.ctrl_seq_counter = inner.ctrl_seq_counter.wrapping_add(1);
        drop(inner);
        let payload = ControlPacketPayload::Handshake(ControlPayload::with_ack_bit(
            ControlType::InitialConnect,
            ack,
        ));
        if let Ok(pkt) = self.build_control_packet(global_seq, payload, 0, PacketOptions::ARQ) {
            self.schedule_control(pkt).await;
        }
    }

    pub async fn schedule_reset(&self, ack: bool) {
        let mut inner = self.inner.lock().await;
        let global_seq = inner.ctrl_seq_counter;
        inner.ctrl_seq_counter = inner.ctrl_seq_counter.wrapping_add(1);
        drop(inner);
        let payload = ControlPacketPayload::Handshake(ControlPayload::with_ack_bit(
            ControlType::Reset,
            ack,
        ));
        if let Ok(pkt) = self.build_control_packet(global_seq, payload, 0, PacketOptions::ARQ) {
            self.schedule_control(pkt).await;
        }
    }

    pub async fn schedule_fin(&self, port: u8, ack: bool) {
        let mut inner = self.inner.lock().await;
        let global_seq = inner.ctrl_seq_counter;
        inner.ctrl_seq_counter = inner.ctrl_seq_counter.wrapping_add(1);
        drop(inner);
        let payload = ControlPacketPayload::Handshake(ControlPayload::fin(port, ack));
        if let Ok(pkt) = self.build_control_packet(global_seq, payload, 0, PacketOptions::ARQ) {
            self.schedule_control(pkt).await;
        }
    }

    pub async fn schedule_sync(&self, port: u8, channel: u8, options: PacketOptions, sync: SyncPayload) {
        let mut inner = self.inner.lock().await;
        let global_seq = inner.ctrl_seq_counter;
        inner.ctrl_seq_counter = inner.ctrl_seq_counter.wrapping_add(1);
        drop(inner);
        let bytes = ControlPacketPayload::Sync(sync).to_bytes();
        let header_result = Header::new_data(global_seq, 0, 0, port & 0x7F, false, bytes.len() as u16)
            .map(|mut h| {
                h.flags = Flags::CTRL;
                h
            });
        if let Ok(header) = header_result {
            let pkt = Packet::new(header, Bytes::from(bytes), channel, options);
            self.schedule_control(pkt).await;
        }
    }

    pub async fn set_channel_available(&self, channel: u8, available: bool) {
        let mut inner = self.inner.lock().await;
        if available {
            inner.channel_blacklist.remove(&channel);
        } else {
            inner.channel_blacklist.insert(channel);
        }
        self.recompute_state(&mut inner).await;
        let became_available = available && inner.state == TxState::Running;
        drop(inner);
        if became_available {
            self.app.send_control_message(ControlMessage::Available).await;
        }
        self.cond.notify_one();
    }

    pub async fn notify_link_availability(&self, up: bool) {
        let mut inner = self.inner.lock().await;
        inner.link_up = up;
        if !up {
            inner.retransmission_slot = None;
        }
        self.recompute_state(&mut inner).await;
        drop(inner);
        self.cond.notify_one();
    }

    /// One iteration of the tx dispatch loop (`spec.md` §4.4 "Tx loop").
    /// Returns `true` if a frame was sent.
    #[instrument(skip(self))]
    pub async fn dispatch_once(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state != TxState::Running {
            return false;
        }

        if let Some(seq_pkt) = self.control_queue.peek().await {
            let is_arq = seq_pkt.value.is_arq();
            if is_arq && inner.retransmission_slot.is_some() {
                return false;
            }
            self.control_queue.pop().await;
            let pkt = seq_pkt.value;
            let Ok(frame) = WireCodec::encode(pkt.header, &pkt.payload) else {
                return false;
            };
            let sent = self.link.send_frame(DEFAULT_RESERVED_CHANNEL, &frame).await;
            if sent && is_arq {
                inner.retransmission_slot = Some(RetransmissionSlot {
                    frame: frame.freeze(),
                    channel: DEFAULT_RESERVED_CHANNEL,
                    global_seq: pkt.global_seq(),
                    started_at: self.clock.now(),
                    retransmission_count: 0,
                });
            }
            self.recompute_state(&mut inner).await;
            return sent;
        }

        let ports: Vec<u8> = inner.port_queues.keys().copied().collect();
        if ports.is_empty() {
            return false;
        }
        let mut sorted = ports.clone();
        sorted.sort_unstable();
        let start = sorted
            .iter()
            .position(|&p| p >= inner.round_robin_cursor)
            .unwrap_or(0);
        for i in 0..sorted.len() {
            let idx = (start + i) % sorted.len();
            let port = sorted[idx];
            let channel = inner.port_channel.get(&port).copied().unwrap_or(DEFAULT_RESERVED_CHANNEL);
            if inner.channel_blacklist.contains(&channel) {
                continue;
            }
            let Some(q) = inner.port_queues.get(&port) else { continue };
            if q.is_empty() {
                continue;
            }
            let is_arq = q.front().map(|p| p.is_arq()).unwrap_or(false);
            if is_arq && inner.retransmission_slot.is_some() {
                continue;
            }
            let pkt = inner.port_queues.get_mut(&port).unwrap().pop_front().unwrap();
            inner.round_robin_cursor = port.wrapping_add(1);
            let Ok(frame) = WireCodec::encode(pkt.header, &pkt.payload) else {
                return false;
            };
            let sent = self.link.send_frame(channel, &frame).await;
            if sent {
                if is_arq {
                    inner.retransmission_slot = Some(RetransmissionSlot {
                        frame: frame.freeze(),
                        channel,
                        global_seq: pkt.global_seq(),
                        started_at: self.clock.now(),
                        retransmission_count: 0,
                    });
                }
            } else {
                // The link rejected the send (channel backed up); blacklist
                // it and put the packet back at the head of its queue until
                // a `handle_buffer_empty` callback lifts the blacklist.
                inner.port_queues.get_mut(&port).unwrap().push_front(pkt);
                inner.channel_blacklist.insert(channel);
            }
            self.recompute_state(&mut inner).await;
            return sent;
        }
        false
    }

    /// Ack-wait timer check (`spec.md` §4.4 "Ack timeout"). Driven by the
    /// engine's tx worker loop, either polled each iteration or via a timed
    /// wait on `cond`.
    pub async fn check_ack_timeout(&self) -> TimeoutOutcome {
        let mut inner = self.inner.lock().await;
        let Some(slot) = inner.retransmission_slot.as_mut() else {
            return TimeoutOutcome::NoTimerPending;
        };
        if !crate::clock::has_elapsed(slot.started_at, self.clock.now(), self.config.ack_wait_time) {
            return TimeoutOutcome::NotYetDue;
        }
        if slot.retransmission_count < self.config.max_retransmission_count {
            slot.retransmission_count += 1;
            slot.started_at = self.clock.now();
            let frame = slot.frame.clone();
            let channel = slot.channel;
            drop(inner);
            self.link.send_frame(channel, &frame).await;
            debug!("retransmitted ARQ packet after ack timeout");
            TimeoutOutcome::Retransmitted
        } else {
            inner.retransmission_slot = None;
            self.recompute_state(&mut inner).await;
            drop(inner);
            warn!("ARQ packet exceeded max retransmission count, escalating to RESET");
            self.app
                .send_control_message(ControlMessage::Error(S3tpErrorCode::InternalError))
                .await;
            TimeoutOutcome::Exhausted
        }
    }

    /// Called when an ack for `seq` is received (piggyback or standalone),
    /// freeing the retransmission slot if it matches.
    pub async fn notify_acknowledgement(&self, seq: u8) {
        let mut inner = self.inner.lock().await;
        let matches = inner
            .retransmission_slot
            .as_ref()
            .map(|s| s.global_seq == seq)
            .unwrap_or(false);
        if matches {
            inner.retransmission_slot = None;
            self.recompute_state(&mut inner).await;
            drop(inner);
            self.cond.notify_one();
        }
    }

    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.port_queues.clear();
        inner.port_channel.clear();
        inner.round_robin_cursor = 0;
        inner.data_seq_counter = 0;
        inner.ctrl_seq_counter = 0;
        inner.port_seq_counters.clear();
        inner.retransmission_slot = None;
        inner.state = TxState::Waiting;
        drop(inner);
        self.control_queue.clear().await;
    }

    pub async fn queue_depth(&self, port: u8) -> usize {
        self.inner
            .lock()
            .await
            .port_queues
            .get(&port)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}

trait HeaderFlagsExt {
    fn flags(self, flags: Flags) -> Self;
}

impl HeaderFlagsExt for Header {
    fn flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as StdOrdering};
    use std::sync::Mutex as StdMutex;

    struct FakeLink {
        sent: StdMutex<Vec<(u8, Vec<u8>)>>,
        up_channels: StdMutex<HashSet<u8>>,
        accept: std::sync::atomic::AtomicBool,
    }

    impl FakeLink {
        fn new() -> Self {
            Self {
                sent: StdMutex::new(Vec::new()),
                up_channels: StdMutex::new((0..7).collect()),
                accept: std::sync::atomic::AtomicBool::new(true),
            }
        }
    }

    #[async_trait::async_trait]
    impl LinkInterface for FakeLink {
        async fn send_frame(&self, channel: u8, bytes: &[u8]) -> bool {
            if !self.accept.load(StdOrdering::Relaxed) {
                return false;
            }
            self.sent.lock().unwrap().push((channel, bytes.to_vec()));
            true
        }
        fn is_channel_up(&self, channel: u8) -> bool {
            self.up_channels.lock().unwrap().contains(&channel)
        }
        async fn start(&self) {}
        async fn stop(&self) {}
    }

    struct NullApp {
        count: AtomicUsize,
    }
    impl NullApp {
        fn new() -> Self {
            Self { count: AtomicUsize::new(0) }
        }
    }
    #[async_trait::async_trait]
    impl ApplicationCallback for NullApp {
        async fn on_connected(&self, _port: u8) {}
        async fn on_disconnected(&self, _port: u8) {}
        async fn on_message(&self, _port: u8, _bytes: Vec<u8>) {}
        async fn send_control_message(&self, _msg: ControlMessage) {
            self.count.fetch_add(1, StdOrdering::Relaxed);
        }
    }

    fn test_tx() -> (Tx, Arc<FakeLink>) {
        let link = Arc::new(FakeLink::new());
        let app = Arc::new(NullApp::new());
        (Tx::new(S3tpConfig::default(), link.clone(), app), link)
    }

    #[tokio::test]
    async fn enqueue_and_dispatch_single_packet() {
        let (tx, link) = test_tx();
        tx.enqueue_data(3, 1, Bytes::from_static(b"HELLO"), 0, false, PacketOptions::ARQ)
            .await
            .unwrap();
        assert!(tx.dispatch_once().await);
        let sent = link.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (_header, payload) = WireCodec::decode(&sent[0].1).unwrap();
        assert_eq!(payload, Bytes::from_static(b"HELLO"));
    }

    #[tokio::test]
    async fn control_packets_preempt_data() {
        let (tx, link) = test_tx();
        tx.enqueue_data(1, 1, Bytes::from_static(b"x"), 0, false, PacketOptions::empty())
            .await
            .unwrap();
        tx.schedule_setup(false).await;
        assert!(tx.dispatch_once().await);
        let sent = link.sent.lock().unwrap();
        let (header, _payload) = WireCodec::decode(&sent[0].1).unwrap();
        assert!(header.flags.contains(Flags::CTRL));
    }

    #[tokio::test]
    async fn channel_blacklist_skips_blocked_port() {
        let (tx, link) = test_tx();
        tx.enqueue_data(1, 2, Bytes::from_static(b"blocked"), 0, false, PacketOptions::empty())
            .await
            .unwrap();
        tx.enqueue_data(2, 1, Bytes::from_static(b"clear"), 0, false, PacketOptions::empty())
            .await
            .unwrap();
        tx.set_channel_available(2, false).await;
        assert!(tx.dispatch_once().await);
        let sent = link.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (_header, payload) = WireCodec::decode(&sent[0].1).unwrap();
        assert_eq!(payload, Bytes::from_static(b"clear"));
    }

    #[tokio::test]
    async fn rejected_send_blacklists_channel_and_requeues_packet() {
        let (tx, link) = test_tx();
        link.accept.store(false, StdOrdering::Relaxed);
        tx.enqueue_data(1, 2, Bytes::from_static(b"x"), 0, false, PacketOptions::empty())
            .await
            .unwrap();
        assert!(!tx.dispatch_once().await);
        assert_eq!(tx.queue_depth(1).await, 1);
        link.accept.store(true, StdOrdering::Relaxed);
        tx.set_channel_available(2, true).await;
        assert!(tx.dispatch_once().await);
        assert_eq!(tx.queue_depth(1).await, 0);
    }

    #[tokio::test]
    async fn ack_frees_retransmission_slot() {
        let (tx, _link) = test_tx();
        tx.enqueue_data(1, 1, Bytes::from_static(b"x"), 0, false, PacketOptions::ARQ)
            .await
            .unwrap();
        tx.dispatch_once().await;
        assert_eq!(tx.state().await, TxState::Blocked);
        tx.notify_acknowledgement(0).await;
        assert_ne!(tx.state().await, TxState::Blocked);
    }

    #[tokio::test]
    async fn ack_timeout_retransmits_then_escalates() {
        let mut cfg = S3tpConfig::default();
        cfg.ack_wait_time = std::time::Duration::from_millis(0);
        cfg.max_retransmission_count = 1;
        let link = Arc::new(FakeLink::new());
        let app = Arc::new(NullApp::new());
        let tx = Tx::new(cfg, link.clone(), app);
        tx.enqueue_data(1, 1, Bytes::from_static(b"x"), 0, false, PacketOptions::ARQ)
            .await
            .unwrap();
        tx.dispatch_once().await;
        assert_eq!(tx.check_ack_timeout().await, TimeoutOutcome::Retransmitted);
        assert_eq!(tx.check_ack_timeout().await, TimeoutOutcome::Exhausted);
        assert_eq!(tx.state().await, TxState::Waiting);
    }
}
