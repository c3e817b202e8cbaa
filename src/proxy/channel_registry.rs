use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::proxy::error::RelayError;
use crate::proxy::message_queue::MessageQueue;
use crate::proxy::protocol::PeerFrame;

/// Default window in which a dropped peer may reconnect without failing requests.
pub const DEFAULT_RECONNECT_GRACE: Duration = Duration::from_millis(5000);

/// Lifecycle notifications of the bridging channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    PeerConnected,
    ConnectionLost,
}

/// Handle to the connected browser peer. Frames pushed here are written to its socket.
struct PeerConnection {
    id: u64,
    outbound: mpsc::UnboundedSender<String>,
}

/// Tracks the single bridging peer and demultiplexes its frames by request id.
pub struct ChannelRegistry {
    peer: Mutex<Option<PeerConnection>>,
    queues: DashMap<String, Arc<MessageQueue>>,
    teardown: Mutex<Option<JoinHandle<()>>>,
    grace: Duration,
    next_peer_id: AtomicU64,
    connected: watch::Sender<bool>,
    events: broadcast::Sender<ChannelEvent>,
}

impl ChannelRegistry {
    pub fn new(grace: Duration) -> Self {
        let (connected, _) = watch::channel(false);
        let (events, _) = broadcast::channel(16);
        Self {
            peer: Mutex::new(None),
            queues: DashMap::new(),
            teardown: Mutex::new(None),
            grace,
            next_peer_id: AtomicU64::new(1),
            connected,
            events,
        }
    }

    fn peer_slot(&self) -> std::sync::MutexGuard<'_, Option<PeerConnection>> {
        self.peer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn teardown_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.teardown.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers `outbound` as the active peer and returns its id.
    pub fn add_peer(&self, outbound: mpsc::UnboundedSender<String>) -> u64 {
        let id = self.next_peer_id.fetch_add(1, Ordering::SeqCst);

        if let Some(timer) = self.teardown_slot().take() {
            timer.abort();
            tracing::info!("Bridging peer reconnected within grace period, in-flight requests kept");
        }

        let replaced = self
            .peer_slot()
            .replace(PeerConnection { id, outbound })
            .is_some();
        if replaced {
            tracing::warn!("A second bridging peer connected; replacing the previous one");
        }

        self.connected.send_replace(true);
        let _ = self.events.send(ChannelEvent::PeerConnected);
        tracing::info!(peer_id = id, "Bridging peer connected");
        id
    }

    /// Called when a peer's socket ends. Queues survive until the grace period elapses.
    pub fn remove_peer(self: &Arc<Self>, id: u64) {
        {
            let mut slot = self.peer_slot();
            match slot.as_ref() {
                Some(peer) if peer.id == id => {
                    *slot = None;
                }
                _ => {
                    tracing::debug!(peer_id = id, "Stale peer disconnected, ignoring");
                    return;
                }
            }
        }
        self.connected.send_replace(false);
        tracing::warn!(
            peer_id = id,
            grace_ms = self.grace.as_millis() as u64,
            "Bridging peer disconnected, waiting for reconnection"
        );

        let registry = Arc::clone(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(registry.grace).await;
            registry.confirm_disconnect();
        });
        if let Some(previous) = self.teardown_slot().replace(timer) {
            previous.abort();
        }
    }

    fn confirm_disconnect(&self) {
        if self.has_peer() {
            return;
        }
        self.teardown_slot().take();

        let mut count = 0;
        self.queues.retain(|_, queue| {
            queue.close();
            count += 1;
            false
        });

        tracing::error!(
            closed_requests = count,
            "Bridging connection lost, failing outstanding requests"
        );
        let _ = self.events.send(ChannelEvent::ConnectionLost);
    }

    pub fn has_peer(&self) -> bool {
        self.peer_slot().is_some()
    }

    /// Writes a frame to the active peer.
    pub fn send(&self, payload: String) -> Result<(), RelayError> {
        let slot = self.peer_slot();
        let peer = slot.as_ref().ok_or(RelayError::NoPeer)?;
        peer.outbound.send(payload).map_err(|_| RelayError::NoPeer)
    }

    /// Creates the mailbox for `request_id`, replacing any stale one.
    pub fn create_queue(&self, request_id: &str) -> Arc<MessageQueue> {
        let queue = Arc::new(MessageQueue::new(request_id));
        if let Some(stale) = self.queues.insert(request_id.to_string(), queue.clone()) {
            stale.close();
        }
        queue
    }

    /// Closes and unregisters the mailbox for `request_id`.
    pub fn remove_queue(&self, request_id: &str) {
        if let Some((_, queue)) = self.queues.remove(request_id) {
            queue.close();
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.queues.len()
    }

    /// Routes one raw text frame from the peer.
    pub fn route_text(&self, text: &str) {
        match serde_json::from_str::<PeerFrame>(text) {
            Ok(frame) => self.route(frame),
            Err(e) => tracing::warn!("Dropping unparsable peer frame: {}", e),
        }
    }

    /// Delivers a peer frame to the queue of its request.
    pub fn route(&self, frame: PeerFrame) {
        let queue = match self.queues.get(&frame.request_id) {
            Some(entry) => entry.value().clone(),
            None => {
                tracing::warn!(
                    request_id = %frame.request_id,
                    event_type = %frame.event_type,
                    "No pending request for peer frame, dropping"
                );
                return;
            }
        };

        let request_id = frame.request_id.clone();
        let event_type = frame.event_type.clone();
        match frame.into_message() {
            Some(message) => queue.enqueue(message),
            None => tracing::warn!(
                request_id = %request_id,
                event_type = %event_type,
                "Unknown peer event type, dropping"
            ),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Waits until a peer is connected. Returns false on timeout.
    pub async fn wait_for_peer(&self, timeout: Duration) -> bool {
        let mut rx = self.connected.subscribe();
        let connected = tokio::time::timeout(timeout, rx.wait_for(|connected| *connected))
            .await
            .map(|res| res.is_ok())
            .unwrap_or(false);
        connected
    }
}
