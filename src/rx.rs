//! Rx module: per-frame validation, reorder/reassembly, and the
//! message-ready notification the application polls (`spec.md` §4.3).

use crate::codec::WireCodec;
use crate::config::S3tpConfig;
use crate::error::Result;
use crate::header::Flags;
use crate::packet::Packet;
use crate::port::PortTable;
use crate::reorder::{PushOutcome, ReorderBuffer};
use crate::tx::Tx;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{instrument, trace, warn};

/// Receiver of CTRL-flagged packets (implemented by the state machine).
/// Kept as a narrow trait so `rx` never depends on connection-setup logic.
#[async_trait]
pub trait ControlSink: Send + Sync {
    async fn on_control_packet(&self, pkt: Packet);
}

struct RxInner {
    ports: PortTable,
}

/// Owns the inbound pipeline: CRC/length validation (delegated to
/// `WireCodec`), ack/control dispatch, and per-port reassembly of data
/// packets drained in order from the `ReorderBuffer`.
pub struct Rx {
    reorder: ReorderBuffer,
    inner: Mutex<RxInner>,
    message_available: Notify,
    tx: Arc<Tx>,
    control_sink: Arc<dyn ControlSink>,
}

impl Rx {
    pub fn new(config: &S3tpConfig, tx: Arc<Tx>, control_sink: Arc<dyn ControlSink>) -> Self {
        Self {
            reorder: ReorderBuffer::new(0, config.window, config.max_queue_size),
            inner: Mutex::new(RxInner {
                ports: PortTable::new(),
            }),
            message_available: Notify::new(),
            tx,
            control_sink,
        }
    }

    /// Six-step per-frame pipeline (`spec.md` §4.3):
    /// 1. decode + CRC/length validate (transient failures are dropped, not
    ///    escalated)
    /// 2. piggyback ACK dispatch to tx
    /// 3. CTRL dispatch to the control sink
    /// 4. DATA insertion into the reorder buffer
    /// 5. in-order drain with per-port sub-sequence verification and
    ///    reassembly
    /// 6. ack scheduling for each frame actually accepted
    #[instrument(skip(self, frame))]
    pub async fn handle_frame(&self, frame: &[u8]) -> Result<()> {
        let (header, payload) = match WireCodec::decode(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                trace!(error = %e, "dropping frame that failed crc/length validation");
                return Ok(());
            }
        };

        if header.flags.contains(Flags::ACK) {
            self.tx.notify_acknowledgement(header.ack as u8).await;
        }

        if header.flags.contains(Flags::CTRL) {
            // Control frames are not reorder-tracked, but may still be sent
            // ARQ (an out-of-band tx option invisible on the wire); ack
            // unconditionally so the sender's retransmission slot clears
            // without waiting for a timeout.
            self.tx.schedule_acknowledgement(header.global_seq).await;
            let pkt = Packet::new(header, payload, 0, crate::packet::PacketOptions::empty());
            self.control_sink.on_control_packet(pkt).await;
            return Ok(());
        }

        if !header.flags.contains(Flags::DATA) {
            return Ok(());
        }

        let port_open = self.inner.lock().await.ports.is_open(header.port);
        if !port_open {
            warn!(port = header.port, "dropping data packet for a closed port");
            return Ok(());
        }

        let global_seq = header.global_seq;
        let pkt = Packet::new(header, payload, 0, crate::packet::PacketOptions::empty());
        match self.reorder.push(pkt).await? {
            PushOutcome::Admitted => {
                self.tx.schedule_acknowledgement(global_seq).await;
            }
            PushOutcome::WindowFull => {
                warn!(global_seq, "dropping data packet outside reorder window");
                return Ok(());
            }
        }

        let ready = self.reorder.drain_ready().await;
        if ready.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.lock().await;
        let mut any_message_ready = false;
        for pkt in ready {
            if self.reassemble_one(&mut inner.ports, pkt) {
                any_message_ready = true;
            }
        }
        drop(inner);
        if any_message_ready {
            self.message_available.notify_waiters();
        }
        Ok(())
    }

    /// Per-port sub-sequence verification and reassembly for a single
    /// in-order data packet. Returns `true` if it completed a message.
    fn reassemble_one(&self, ports: &mut PortTable, pkt: Packet) -> bool {
        let port = pkt.port();
        let header = pkt.header;
        let state = ports.entry(port);

        if header.port_seq != state.next_expected_port_seq {
            warn!(
                port,
                expected = state.next_expected_port_seq,
                got = header.port_seq,
                "port sequence gap, flushing partial reassembly"
            );
            state.flush_reassembly();
            state.next_expected_port_seq = header.port_seq.wrapping_add(1);
            if header.sub_seq != 0 {
                return false;
            }
        } else {
            state.next_expected_port_seq = header.port_seq.wrapping_add(1);
        }

        if header.sub_seq != state.expected_sub_seq {
            warn!(
                port,
                expected = state.expected_sub_seq,
                got = header.sub_seq,
                "sub-sequence gap, dropping fragment"
            );
            state.flush_reassembly();
            return false;
        }

        state.reassembly.extend_from_slice(&pkt.payload);
        state.expected_sub_seq = header.sub_seq.wrapping_add(1);

        if header.more_fragments {
            return false;
        }

        let message = std::mem::take(&mut state.reassembly);
        state.expected_sub_seq = 0;
        state.available_messages.push(message);
        true
    }

    pub async fn is_message_available(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.ports.next_complete_message_count() > 0
    }

    /// Block until at least one complete message is available across any
    /// open port.
    pub async fn wait_for_message(&self) {
        loop {
            if self.is_message_available().await {
                return;
            }
            self.message_available.notified().await;
        }
    }

    pub async fn next_complete_message(&self) -> Option<(u8, Vec<u8>)> {
        self.inner.lock().await.ports.next_complete_message()
    }

    pub async fn open_port_local(&self, port: u8) {
        self.inner.lock().await.ports.open_local(port);
    }

    pub async fn open_port_remote(&self, port: u8) {
        self.inner.lock().await.ports.open_remote(port);
    }

    pub async fn close_port_local(&self, port: u8) {
        self.inner.lock().await.ports.close_local(port);
    }

    pub async fn close_port_remote(&self, port: u8) {
        self.inner.lock().await.ports.close_remote(port);
    }

    pub async fn is_port_open(&self, port: u8) -> bool {
        self.inner.lock().await.ports.is_open(port)
    }

    pub async fn reset(&self) {
        self.reorder.reset(0).await;
        self.inner.lock().await.ports.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{ApplicationCallback, ControlMessage};
    use crate::codec::WireCodec;
    use crate::header::Header;
    use crate::link::LinkInterface;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    struct NullLink;
    #[async_trait::async_trait]
    impl LinkInterface for NullLink {
        async fn send_frame(&self, _channel: u8, _bytes: &[u8]) -> bool {
            true
        }
        fn is_channel_up(&self, _channel: u8) -> bool {
            true
        }
        async fn start(&self) {}
        async fn stop(&self) {}
    }

    struct NullApp;
    #[async_trait::async_trait]
    impl ApplicationCallback for NullApp {
        async fn on_connected(&self, _port: u8) {}
        async fn on_disconnected(&self, _port: u8) {}
        async fn on_message(&self, _port: u8, _bytes: Vec<u8>) {}
        async fn send_control_message(&self, _msg: ControlMessage) {}
    }

    struct RecordingControlSink {
        saw_ctrl: AtomicBool,
        seen: StdMutex<Vec<Packet>>,
    }
    impl RecordingControlSink {
        fn new() -> Self {
            Self {
                saw_ctrl: AtomicBool::new(false),
                seen: StdMutex::new(Vec::new()),
            }
        }
    }
    #[async_trait::async_trait]
    impl ControlSink for RecordingControlSink {
        async fn on_control_packet(&self, pkt: Packet) {
            self.saw_ctrl.store(true, Ordering::SeqCst);
            self.seen.lock().unwrap().push(pkt);
        }
    }

    fn test_rx() -> (Rx, Arc<RecordingControlSink>) {
        let link = Arc::new(NullLink);
        let app = Arc::new(NullApp);
        let tx = Arc::new(Tx::new(S3tpConfig::default(), link, app));
        let sink = Arc::new(RecordingControlSink::new());
        (Rx::new(&S3tpConfig::default(), tx, sink.clone()), sink)
    }

    fn data_frame(global_seq: u8, sub_seq: u8, port_seq: u8, port: u8, more: bool, payload: &[u8]) -> Vec<u8> {
        let h = Header::new_data(global_seq, sub_seq, port_seq, port, more, payload.len() as u16).unwrap();
        WireCodec::encode(h, payload).unwrap().to_vec()
    }

    #[tokio::test]
    async fn single_unfragmented_message_becomes_available() {
        let (rx, _sink) = test_rx();
        rx.open_port_remote(3).await;
        let frame = data_frame(0, 0, 0, 3, false, b"hello");
        rx.handle_frame(&frame).await.unwrap();
        assert!(rx.is_message_available().await);
        let (port, msg) = rx.next_complete_message().await.unwrap();
        assert_eq!(port, 3);
        assert_eq!(msg, b"hello");
    }

    #[tokio::test]
    async fn fragmented_message_reassembles_in_order() {
        let (rx, _sink) = test_rx();
        rx.open_port_remote(1).await;
        rx.handle_frame(&data_frame(0, 0, 0, 1, true, b"ab")).await.unwrap();
        assert!(!rx.is_message_available().await);
        rx.handle_frame(&data_frame(1, 1, 1, 1, false, b"cd")).await.unwrap();
        let (_port, msg) = rx.next_complete_message().await.unwrap();
        assert_eq!(msg, b"abcd");
    }

    #[tokio::test]
    async fn out_of_order_frames_reassemble_once_gap_fills() {
        let (rx, _sink) = test_rx();
        rx.open_port_remote(1).await;
        rx.handle_frame(&data_frame(1, 1, 1, 1, false, b"cd")).await.unwrap();
        assert!(!rx.is_message_available().await);
        rx.handle_frame(&data_frame(0, 0, 0, 1, true, b"ab")).await.unwrap();
        let (_port, msg) = rx.next_complete_message().await.unwrap();
        assert_eq!(msg, b"abcd");
    }

    #[tokio::test]
    async fn control_frame_routed_to_sink_not_reassembly() {
        let (rx, sink) = test_rx();
        let mut h = Header::new_data(0, 0, 0, 0, false, 0).unwrap();
        h.flags = Flags::CTRL;
        let frame = WireCodec::encode(h, b"").unwrap().to_vec();
        rx.handle_frame(&frame).await.unwrap();
        assert!(sink.saw_ctrl.load(Ordering::SeqCst));
        assert!(!rx.is_message_available().await);
    }

    #[tokio::test]
    async fn corrupted_frame_is_dropped_silently() {
        let (rx, _sink) = test_rx();
        let mut frame = data_frame(0, 0, 0, 1, false, b"x");
        *frame.last_mut().unwrap() ^= 0xFF;
        assert!(rx.handle_frame(&frame).await.is_ok());
        assert!(!rx.is_message_available().await);
    }
}
