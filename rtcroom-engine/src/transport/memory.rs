//! In-process transport
//!
//! Loops nothing back on its own: remote events are injected through a
//! [`MemoryTransportHandle`], and everything the engine sends is recorded
//! for inspection. Connect and reconnect outcomes can be scripted.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use super::{Outbound, RoomTransport, TransportError, TransportEvent, TransportResult};
use crate::frame::Frame;
use crate::params::{AudioEncodeParams, EnterRoomParams};
use crate::types::{ChannelKey, StreamType, UserId};

/// A packet the engine handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPacket {
    pub stream_type: StreamType,
    pub packet: Outbound,
}

struct Shared {
    sent: Mutex<Vec<SentPacket>>,
    connect_results: Mutex<VecDeque<TransportResult<()>>>,
    reconnect_results: Mutex<VecDeque<TransportResult<()>>>,
    open_failures: Mutex<HashSet<ChannelKey>>,
    open_channels: Mutex<HashSet<ChannelKey>>,
    opens_allowed: watch::Sender<bool>,
    /// Zero means wall clock
    server_time: AtomicU64,
    connects: AtomicUsize,
    reconnects: AtomicUsize,
}

pub struct MemoryTransport {
    shared: Arc<Shared>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
    // keeps `next_event` pending instead of returning None
    _events_tx: mpsc::UnboundedSender<TransportEvent>,
}

/// Test-side control of a [`MemoryTransport`]
#[derive(Clone)]
pub struct MemoryTransportHandle {
    shared: Arc<Shared>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> (Arc<Self>, MemoryTransportHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (opens_allowed, _) = watch::channel(true);
        let shared = Arc::new(Shared {
            sent: Mutex::new(Vec::new()),
            connect_results: Mutex::new(VecDeque::new()),
            reconnect_results: Mutex::new(VecDeque::new()),
            open_failures: Mutex::new(HashSet::new()),
            open_channels: Mutex::new(HashSet::new()),
            opens_allowed,
            server_time: AtomicU64::new(0),
            connects: AtomicUsize::new(0),
            reconnects: AtomicUsize::new(0),
        });

        let transport = Arc::new(Self {
            shared: shared.clone(),
            events_rx: tokio::sync::Mutex::new(events_rx),
            _events_tx: events_tx.clone(),
        });
        (transport, MemoryTransportHandle { shared, events_tx })
    }
}

#[async_trait]
impl RoomTransport for MemoryTransport {
    async fn connect(&self, _params: &EnterRoomParams) -> TransportResult<()> {
        self.shared.connects.fetch_add(1, Ordering::Relaxed);
        self.shared.connect_results.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn reconnect(&self) -> TransportResult<()> {
        self.shared.reconnects.fetch_add(1, Ordering::Relaxed);
        self.shared.reconnect_results.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn disconnect(&self) {
        self.shared.open_channels.lock().clear();
    }

    async fn open_channel(
        &self,
        key: &ChannelKey,
        _audio: Option<&AudioEncodeParams>,
    ) -> TransportResult<()> {
        let mut allowed = self.shared.opens_allowed.subscribe();
        let gate_open = allowed.wait_for(|open| *open).await.is_ok();
        if !gate_open {
            return Err(TransportError::Closed);
        }
        if self.shared.open_failures.lock().contains(key) {
            return Err(TransportError::Transient(format!("cannot open {key}")));
        }
        self.shared.open_channels.lock().insert(key.clone());
        Ok(())
    }

    async fn close_channel(&self, key: &ChannelKey) {
        self.shared.open_channels.lock().remove(key);
    }

    async fn send(&self, stream_type: StreamType, packet: Outbound) -> TransportResult<()> {
        self.shared.sent.lock().push(SentPacket {
            stream_type,
            packet,
        });
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        self.events_rx.lock().await.recv().await
    }

    fn server_time_ms(&self) -> u64 {
        match self.shared.server_time.load(Ordering::Relaxed) {
            0 => u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default(),
            t => t,
        }
    }
}

impl MemoryTransportHandle {
    pub fn emit(&self, event: TransportEvent) {
        // the transport owns a sender clone, so the receiver is alive
        let _ = self.events_tx.send(event);
    }

    pub fn user_entered(&self, user_id: &str) {
        self.emit(TransportEvent::UserEntered(UserId::from(user_id)));
    }

    pub fn user_left(&self, user_id: &str) {
        self.emit(TransportEvent::UserLeft(UserId::from(user_id)));
    }

    pub fn stream_available(&self, user_id: &str, stream_type: StreamType, available: bool) {
        self.emit(TransportEvent::StreamAvailable {
            user_id: UserId::from(user_id),
            stream_type,
            available,
        });
    }

    pub fn media(&self, user_id: &str, stream_type: StreamType, frame: Frame) {
        self.emit(TransportEvent::Media {
            user_id: UserId::from(user_id),
            stream_type,
            frame,
        });
    }

    #[must_use]
    pub fn sent(&self) -> Vec<SentPacket> {
        self.shared.sent.lock().clone()
    }

    #[must_use]
    pub fn sent_count(&self) -> usize {
        self.shared.sent.lock().len()
    }

    pub fn script_connect(&self, result: TransportResult<()>) {
        self.shared.connect_results.lock().push_back(result);
    }

    pub fn script_reconnect(&self, result: TransportResult<()>) {
        self.shared.reconnect_results.lock().push_back(result);
    }

    pub fn fail_open(&self, key: ChannelKey) {
        self.shared.open_failures.lock().insert(key);
    }

    /// Park channel opens until [`release_channel_opens`](Self::release_channel_opens)
    pub fn hold_channel_opens(&self) {
        self.shared.opens_allowed.send_replace(false);
    }

    pub fn release_channel_opens(&self) {
        self.shared.opens_allowed.send_replace(true);
    }

    #[must_use]
    pub fn is_open(&self, key: &ChannelKey) -> bool {
        self.shared.open_channels.lock().contains(key)
    }

    pub fn set_server_time(&self, ms: u64) {
        self.shared.server_time.store(ms, Ordering::Relaxed);
    }

    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn reconnect_count(&self) -> usize {
        self.shared.reconnects.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[tokio::test]
    async fn test_scripted_connect_results() {
        let (transport, handle) = MemoryTransport::new();
        handle.script_connect(Err(TransportError::Rejected {
            code: ErrorCode::BannedByServer,
            reason: "banned".into(),
        }));

        let params = EnterRoomParams::default();
        assert!(transport.connect(&params).await.is_err());
        assert!(transport.connect(&params).await.is_ok());
        assert_eq!(handle.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_events_are_delivered_in_order() {
        let (transport, handle) = MemoryTransport::new();
        handle.user_entered("a");
        handle.user_left("a");

        assert_eq!(
            transport.next_event().await,
            Some(TransportEvent::UserEntered(UserId::from("a")))
        );
        assert_eq!(
            transport.next_event().await,
            Some(TransportEvent::UserLeft(UserId::from("a")))
        );
    }

    #[tokio::test]
    async fn test_open_failures_and_server_time() {
        let (transport, handle) = MemoryTransport::new();
        let key = ChannelKey::send(StreamType::VideoAux);
        handle.fail_open(key.clone());
        assert!(transport.open_channel(&key, None).await.is_err());
        assert!(!handle.is_open(&key));

        handle.set_server_time(1234);
        assert_eq!(transport.server_time_ms(), 1234);
    }
}
