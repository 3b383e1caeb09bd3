//! Relay session bookkeeping.
//!
//! A session admits at most two parties. Admission is an atomic slot
//! reservation: the manager lock covers both the session lookup and the
//! "test slot and assign" step, so two concurrent connects to an empty id
//! both succeed (one per slot) and a third is refused. A reservation not yet
//! bound to a socket is released when its guard drops, so an aborted upgrade
//! cannot leak a slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;

/// Admission errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AdmitError {
    #[error("session already has two endpoints")]
    SessionFull,

    #[error("relay at session capacity")]
    AtCapacity,
}

/// Per-session slot state, guarded by a sync mutex (no awaits under lock).
struct Slots {
    reserved: [bool; 2],
    senders: [Option<mpsc::Sender<Vec<u8>>>; 2],
}

/// One relay session: up to two parties and their metering counters.
pub struct RelaySession {
    pub session_id: String,
    started_at: Instant,
    slots: Mutex<Slots>,
    /// Bytes received from party 0 / party 1.
    bytes: [AtomicU64; 2],
    paired_tx: watch::Sender<bool>,
    paired_rx: watch::Receiver<bool>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    metered: AtomicBool,
}

impl RelaySession {
    fn new(session_id: &str) -> Self {
        let (paired_tx, paired_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);
        Self {
            session_id: session_id.to_string(),
            started_at: Instant::now(),
            slots: Mutex::new(Slots {
                reserved: [false; 2],
                senders: [None, None],
            }),
            bytes: [AtomicU64::new(0), AtomicU64::new(0)],
            paired_tx,
            paired_rx,
            closed_tx,
            closed_rx,
            metered: AtomicBool::new(false),
        }
    }

    fn reserve_slot(&self) -> Option<usize> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let index = slots.reserved.iter().position(|r| !r)?;
        slots.reserved[index] = true;
        Some(index)
    }

    fn release_slot(&self, index: usize) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.reserved[index] = false;
        slots.senders[index] = None;
    }

    /// Bind a party's outbound queue to its reserved slot. Pairing is
    /// signalled once both slots are bound.
    fn bind(&self, index: usize, sender: mpsc::Sender<Vec<u8>>) {
        let both = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.senders[index] = Some(sender);
            slots.senders.iter().all(Option::is_some)
        };
        if both {
            info!(session_id = %self.session_id, "Relay session open (both parties connected)");
            let _ = self.paired_tx.send(true);
        } else {
            info!(session_id = %self.session_id, "Relay session half-open (waiting for peer)");
        }
    }

    /// Watch that flips to `true` once both parties are bound.
    pub fn paired(&self) -> watch::Receiver<bool> {
        self.paired_rx.clone()
    }

    /// Watch that flips to `true` when the session closes.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Forward one frame from `from_index` to the other party, counting the
    /// bytes against the source direction. Blocks when the peer's queue is
    /// saturated. Returns `false` when the peer is gone.
    pub async fn forward(&self, from_index: usize, data: Vec<u8>) -> bool {
        let peer = {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.senders[1 - from_index].clone()
        };
        let Some(peer) = peer else {
            return false;
        };

        self.bytes[from_index].fetch_add(data.len() as u64, Ordering::Relaxed);
        peer.send(data).await.is_ok()
    }

    /// Close the session: both parties' loops observe the closed watch, and
    /// the metering record is emitted exactly once.
    pub fn close(&self) {
        let _ = self.closed_tx.send(true);

        if self.metered.swap(true, Ordering::SeqCst) {
            return;
        }

        let bytes_a = self.bytes[0].load(Ordering::Relaxed);
        let bytes_b = self.bytes[1].load(Ordering::Relaxed);
        info!(
            session_id = %self.session_id,
            duration_secs = self.started_at.elapsed().as_secs_f64(),
            bytes_a_to_b = bytes_a,
            bytes_b_to_a = bytes_b,
            total_bytes = bytes_a + bytes_b,
            "Relay session closed"
        );
    }
}

/// A reserved (and later bound) party slot. Dropping an unbound reservation
/// releases the slot.
pub struct PartySlot {
    session: Arc<RelaySession>,
    index: usize,
    bound: bool,
}

impl PartySlot {
    pub fn session(&self) -> &Arc<RelaySession> {
        &self.session
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether this reservation completed the pair.
    pub fn is_second_party(&self) -> bool {
        self.index == 1
    }

    /// Bind the party's outbound queue; returns the receiving half the
    /// socket task drains.
    pub fn bind(&mut self, queue_depth: usize) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(queue_depth);
        self.session.bind(self.index, tx);
        self.bound = true;
        rx
    }
}

impl Drop for PartySlot {
    fn drop(&mut self) {
        if !self.bound {
            debug!(
                session_id = %self.session.session_id,
                index = self.index,
                "Releasing unbound relay slot"
            );
            self.session.release_slot(self.index);
        }
    }
}

/// Thread-safe registry of active relay sessions.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<Mutex<HashMap<String, Arc<RelaySession>>>>,
    config: Arc<RelayConfig>,
}

impl SessionManager {
    pub fn new(config: Arc<RelayConfig>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Reserve a party slot in the named session, creating the session on
    /// first contact. Lookup and slot assignment happen under one lock.
    pub fn reserve(&self, session_id: &str) -> Result<PartySlot, AdmitError> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());

        let session = match sessions.get(session_id) {
            Some(existing) => Arc::clone(existing),
            None => {
                if sessions.len() >= self.config.max_sessions {
                    warn!(session_id, "Relay at capacity, refusing session");
                    return Err(AdmitError::AtCapacity);
                }
                let created = Arc::new(RelaySession::new(session_id));
                sessions.insert(session_id.to_string(), Arc::clone(&created));
                created
            }
        };

        let index = session.reserve_slot().ok_or(AdmitError::SessionFull)?;
        Ok(PartySlot {
            session,
            index,
            bound: false,
        })
    }

    /// Close and evict a session. Either party's exit path may call this;
    /// the second call is a no-op.
    pub fn remove(&self, session_id: &str) {
        let session = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.remove(session_id)
        };
        if let Some(session) = session {
            session.close();
        }
    }

    /// Number of active sessions.
    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
