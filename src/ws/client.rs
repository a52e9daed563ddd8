//! Per-connection endpoint handle.
//!
//! A `Client` is the hub-side view of one WebSocket connection: a bounded
//! outbound queue feeding the connection's write task, plus identity and
//! room membership. The socket itself lives in the I/O tasks.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::protocol::UserInfo;

/// Outbound queue capacity per connection. A full queue marks the client
/// as a slow consumer and it is dropped rather than blocking publishers.
pub const OUTBOUND_QUEUE_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// Queue at capacity: the slow-consumer signal.
    Full,
    /// Queue already closed; the frame is silently discarded.
    Closed,
}

#[derive(Debug)]
pub struct Client {
    conn_id: String,
    queue: mpsc::Sender<Vec<u8>>,
    /// Cancelled exactly when the hub removes the client from its registry.
    /// The write task observes this and shuts the socket down; cancellation
    /// is idempotent, so the queue is never "closed twice".
    closed: CancellationToken,
    state: RwLock<ClientState>,
}

#[derive(Debug, Default)]
struct ClientState {
    user_info: UserInfo,
    room_subscriptions: HashSet<String>,
    presence_rooms: HashSet<String>,
}

impl Client {
    /// Create a client handle and the receiving end of its outbound queue.
    pub fn new(conn_id: String) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let client = Arc::new(Self {
            conn_id,
            queue: tx,
            closed: CancellationToken::new(),
            state: RwLock::new(ClientState::default()),
        });
        (client, rx)
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    /// Token observed by the write task; cancelled on queue close.
    pub fn close_signal(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Close the outbound queue. Reserved for the hub loop, which removes
    /// the client from the registry in the same step.
    pub(crate) fn close_queue(&self) {
        self.closed.cancel();
    }

    /// Non-blocking enqueue of an outbound frame payload.
    pub fn try_enqueue(&self, frame: Vec<u8>) -> Result<(), EnqueueError> {
        if self.closed.is_cancelled() {
            return Err(EnqueueError::Closed);
        }
        self.queue.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    pub fn set_user_info(&self, user_info: UserInfo) {
        self.state.write().unwrap().user_info = user_info;
    }

    pub fn user_info(&self) -> UserInfo {
        self.state.read().unwrap().user_info.clone()
    }

    pub fn record_subscription(&self, room: &str) {
        self.state.write().unwrap().room_subscriptions.insert(room.to_string());
    }

    pub fn forget_subscription(&self, room: &str) {
        self.state.write().unwrap().room_subscriptions.remove(room);
    }

    pub fn record_presence(&self, room: &str) {
        self.state.write().unwrap().presence_rooms.insert(room.to_string());
    }

    pub fn forget_presence(&self, room: &str) {
        self.state.write().unwrap().presence_rooms.remove(room);
    }

    /// Snapshot of (subscribed rooms, presence rooms), taken under the
    /// client lock and released before any room lock is acquired.
    pub fn membership_snapshot(&self) -> (Vec<String>, Vec<String>) {
        let state = self.state.read().unwrap();
        (
            state.room_subscriptions.iter().cloned().collect(),
            state.presence_rooms.iter().cloned().collect(),
        )
    }
}
