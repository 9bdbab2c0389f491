//! Connection lifecycle: three-way session setup, two-way reset, and
//! per-port open/close via SYNC/FIN control packets (`spec.md` §4.5).

use crate::app::{ApplicationCallback, ControlMessage};
use crate::codes::S3tpErrorCode;
use crate::config::{S3tpConfig, SYNC_PORT_SEQ_LEN};
use crate::control::{
    ControlPacketPayload, ControlPayload, ControlType, SyncPayload, SYNC_ID_INITIATOR,
    SYNC_ID_RESPONDER,
};
use crate::header::Flags;
use crate::packet::Packet;
use crate::rx::{ControlSink, Rx};
use crate::tx::Tx;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

/// Session-level handshake state (`spec.md` §4.5). Per-port open/close runs
/// independently of this via SYNC/FIN and does not transition it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Disconnected,
    AwaitingSetupAck,
    AwaitingSetupFinal,
    Connected,
    AwaitingResetAck,
}

struct Inner {
    session: SessionState,
}

/// Drives the session handshake and per-port open/close, sitting between
/// `rx` (as its `ControlSink`) and `tx` (as the sender of control packets).
pub struct StateMachine {
    inner: Mutex<Inner>,
    tx: Arc<Tx>,
    rx: Arc<Rx>,
    app: Arc<dyn ApplicationCallback>,
}

impl StateMachine {
    pub fn new(_config: &S3tpConfig, tx: Arc<Tx>, rx: Arc<Rx>, app: Arc<dyn ApplicationCallback>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                session: SessionState::Disconnected,
            }),
            tx,
            rx,
            app,
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.session == SessionState::Connected
    }

    /// Initiate the three-way setup handshake (`spec.md` §4.5): send
    /// `INITIAL_CONNECT(ack=0)`, wait for the peer's `ack=1` reply, then send
    /// the final `ack=1` to complete the handshake on both sides.
    #[instrument(skip(self))]
    pub async fn connect(&self) {
        let mut inner = self.inner.lock().await;
        if inner.session != SessionState::Disconnected {
            return;
        }
        inner.session = SessionState::AwaitingSetupAck;
        drop(inner);
        self.tx.schedule_setup(false).await;
    }

    /// Two-way reset handshake (`spec.md` §4.5): send `RESET(ack=0)`, flush
    /// local state once the peer's `ack=1` reply arrives. Also invoked
    /// internally when a tx ARQ slot exhausts its retransmission budget.
    #[instrument(skip(self))]
    pub async fn trigger_local_reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.session = SessionState::AwaitingResetAck;
        drop(inner);
        self.tx.schedule_reset(false).await;
    }

    async fn complete_reset(&self, inner: &mut Inner) {
        self.tx.reset().await;
        self.rx.reset().await;
        inner.session = SessionState::Disconnected;
        self.app
            .send_control_message(ControlMessage::Error(S3tpErrorCode::ChannelBroken))
            .await;
    }

    /// Request a new logical port be opened, advertising it to the peer via
    /// a SYNC control packet carrying this port's slot in the `port_seq`
    /// array (`spec.md` §3's sync payload).
    pub async fn open_port(&self, port: u8, channel: u8) {
        self.rx.open_port_local(port).await;
        let mut port_seq = vec![0u8; SYNC_PORT_SEQ_LEN];
        if (port as usize) < SYNC_PORT_SEQ_LEN {
            port_seq[port as usize] = 1;
        }
        let payload = SyncPayload {
            sync_id: SYNC_ID_INITIATOR,
            tx_global_seq: 0,
            port_seq,
        };
        self.tx
            .schedule_sync(port, channel, crate::packet::PacketOptions::ARQ, payload)
            .await;
    }

    /// Close a locally-owned port, notifying the peer via FIN.
    pub async fn close_port(&self, port: u8) {
        self.rx.close_port_local(port).await;
        self.tx.schedule_fin(port, false).await;
    }

    async fn handle_handshake(&self, payload: ControlPayload, piggyback_ack: bool) {
        let mut inner = self.inner.lock().await;
        match payload.control_type {
            ControlType::InitialConnect => {
                let ack = payload.ack_bit();
                match (inner.session, ack) {
                    (SessionState::Disconnected, false) => {
                        inner.session = SessionState::AwaitingSetupFinal;
                        drop(inner);
                        self.tx.schedule_setup(true).await;
                    }
                    (SessionState::AwaitingSetupAck, true) => {
                        inner.session = SessionState::Connected;
                        drop(inner);
                        self.tx.schedule_setup(true).await;
                        info!("session established (initiator)");
                        self.app.on_connected(0).await;
                    }
                    (SessionState::AwaitingSetupFinal, true) => {
                        inner.session = SessionState::Connected;
                        drop(inner);
                        info!("session established (responder)");
                        self.app.on_connected(0).await;
                    }
                    (state, ack) => {
                        warn!(?state, ack, "unexpected INITIAL_CONNECT in this state");
                    }
                }
            }
            ControlType::Reset => {
                let ack = payload.ack_bit();
                match (inner.session, ack) {
                    (SessionState::AwaitingResetAck, true) => {
                        self.complete_reset(&mut inner).await;
                        info!("reset handshake complete (initiator)");
                    }
                    (_, false) => {
                        self.tx.schedule_reset(true).await;
                        self.complete_reset(&mut inner).await;
                        info!("reset handshake complete (responder)");
                    }
                    (state, ack) => {
                        warn!(?state, ack, "unexpected RESET in this state");
                    }
                }
            }
            ControlType::Fin => {
                let port = payload.fin_port();
                drop(inner);
                if !payload.ack_bit() {
                    self.rx.close_port_remote(port).await;
                    self.tx.schedule_fin(port, true).await;
                } else {
                    self.rx.close_port_remote(port).await;
                }
                self.app.on_disconnected(port).await;
            }
            ControlType::Sync => unreachable!("sync payloads are handled via ControlPacketPayload::Sync"),
        }
        let _ = piggyback_ack;
    }

    async fn handle_sync(&self, port: u8, sync: SyncPayload) {
        self.rx.open_port_remote(port).await;
        if sync.sync_id == SYNC_ID_INITIATOR {
            self.app.on_connected(port).await;
            let reply = SyncPayload {
                sync_id: SYNC_ID_RESPONDER,
                tx_global_seq: sync.tx_global_seq,
                port_seq: sync.port_seq,
            };
            self.tx
                .schedule_sync(port, 0, crate::packet::PacketOptions::ARQ, reply)
                .await;
        } else {
            self.app.on_connected(port).await;
        }
    }
}

#[async_trait]
impl ControlSink for StateMachine {
    async fn on_control_packet(&self, pkt: Packet) {
        if !pkt.header.flags.contains(Flags::CTRL) {
            return;
        }
        let piggyback_ack = pkt.header.flags.contains(Flags::ACK);
        match ControlPacketPayload::from_bytes(&pkt.payload) {
            Ok(ControlPacketPayload::Handshake(payload)) => {
                self.handle_handshake(payload, piggyback_ack).await;
            }
            Ok(ControlPacketPayload::Sync(sync)) => {
                self.handle_sync(pkt.header.port, sync).await;
            }
            Err(e) => {
                warn!(error = %e, "dropping malformed control payload");
            }
        }
    }
}
