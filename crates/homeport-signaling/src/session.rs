//! In-memory endpoint session map.
//!
//! One live signaling session per device id. A new authenticated connection
//! for the same device id supersedes the previous one: the old socket is
//! told to close with a distinct reason before the map entry is replaced.
//! Removal is compare-and-swap by session token so a stale disconnect never
//! evicts its successor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use homeport_proto::SignalMessage;

/// WebSocket close code for policy violations (also used for supersession).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Close reason sent to a superseded session.
pub const SUPERSEDED_REASON: &str = "superseded";

/// Event pushed to a session's socket writer task.
#[derive(Debug)]
pub enum Outbound {
    /// Deliver a signaling message.
    Message(SignalMessage),
    /// Close the socket with the given code and reason, then stop.
    Close { code: u16, reason: &'static str },
}

/// Handle to one live signaling session.
#[derive(Clone)]
pub struct EndpointSession {
    /// Unique per-connection token, used for compare-and-swap removal.
    pub token: u64,
    /// Owner of the device this session authenticated as.
    pub user_id: i64,
    /// Sender feeding the connection's socket writer task.
    pub outbound: mpsc::Sender<Outbound>,
}

/// Thread-safe map of device id to live session.
#[derive(Clone, Default)]
pub struct EndpointSessions {
    inner: Arc<RwLock<HashMap<String, EndpointSession>>>,
    next_token: Arc<AtomicU64>,
}

impl EndpointSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session for a device id, superseding any prior session.
    ///
    /// The prior socket (if any) is sent a close event before the entry is
    /// replaced; insert and supersede are serialised under the map lock.
    /// Returns the token identifying the new session.
    pub async fn insert(
        &self,
        device_id: &str,
        user_id: i64,
        outbound: mpsc::Sender<Outbound>,
    ) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let session = EndpointSession {
            token,
            user_id,
            outbound,
        };

        let mut inner = self.inner.write().await;
        if let Some(prior) = inner.insert(device_id.to_string(), session) {
            info!(device_id, "Superseding existing signaling session");
            if prior
                .outbound
                .send(Outbound::Close {
                    code: CLOSE_POLICY_VIOLATION,
                    reason: SUPERSEDED_REASON,
                })
                .await
                .is_err()
            {
                warn!(device_id, "Superseded session already gone");
            }
        } else {
            info!(device_id, "Signaling session connected");
        }
        token
    }

    /// Remove the session for a device id only if it still carries `token`.
    ///
    /// Returns `true` when the entry was removed.
    pub async fn remove_if(&self, device_id: &str, token: u64) -> bool {
        let mut inner = self.inner.write().await;
        match inner.get(device_id) {
            Some(current) if current.token == token => {
                inner.remove(device_id);
                info!(device_id, "Signaling session disconnected");
                true
            }
            _ => false,
        }
    }

    /// Look up the live session for a device id.
    pub async fn get(&self, device_id: &str) -> Option<EndpointSession> {
        self.inner.read().await.get(device_id).cloned()
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
