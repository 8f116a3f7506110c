//! Per-camera session state
//!
//! Two maps, pending and active, keyed by the opaque session identifier the
//! negotiation layer supplies. A session id lives in at most one of the two:
//! negotiation writes pending, start promotes pending into active, and every
//! teardown path removes whatever half is present. Only the owning
//! `StreamController` mutates these maps.

use crate::supervisor::StreamSupervisor;
use std::collections::HashMap;
use std::net::IpAddr;
use tokio::sync::RwLock;

pub type SessionId = String;

/// SRTP parameters for one stream, exactly as negotiated
#[derive(Debug, Clone)]
pub struct StreamCrypto {
    /// Suite identifier (e.g. `AES_CM_128_HMAC_SHA1_80`)
    pub suite: String,
    /// Concatenated key and salt material
    pub key_salt: Vec<u8>,
}

/// Transport parameters for one stream of a session
#[derive(Debug, Clone)]
pub struct StreamEndpoint {
    /// Return port reserved on the camera host; also the destination port
    /// at the controller address (symmetric RTP)
    pub port: u16,
    /// Synchronization source identifier
    pub ssrc: u32,
    pub crypto: StreamCrypto,
}

/// A negotiated session that has not started streaming yet
#[derive(Debug, Clone)]
pub struct PendingSession {
    pub controller_addr: IpAddr,
    pub video: StreamEndpoint,
    pub audio: StreamEndpoint,
}

/// A streaming session with a live transcoder process
pub struct ActiveSession {
    pub supervisor: StreamSupervisor,
    /// Return port retained for liveness bookkeeping
    pub video_port: u16,
}

/// Session store for a single camera
#[derive(Default)]
pub struct SessionStore {
    pending: RwLock<HashMap<SessionId, PendingSession>>,
    active: RwLock<HashMap<SessionId, ActiveSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a pending session, returning any record it replaced
    pub async fn put_pending(&self, id: &str, session: PendingSession) -> Option<PendingSession> {
        self.pending.write().await.insert(id.to_string(), session)
    }

    /// Remove and return the pending record for promotion or teardown
    pub async fn take_pending(&self, id: &str) -> Option<PendingSession> {
        self.pending.write().await.remove(id)
    }

    pub async fn get_pending(&self, id: &str) -> Option<PendingSession> {
        self.pending.read().await.get(id).cloned()
    }

    pub async fn insert_active(&self, id: &str, session: ActiveSession) {
        self.active.write().await.insert(id.to_string(), session);
    }

    /// Remove an active session; a missing id is a no-op
    pub async fn remove_active(&self, id: &str) -> Option<ActiveSession> {
        self.active.write().await.remove(id)
    }

    /// Remove and return every active session (process-wide shutdown)
    pub async fn drain_active(&self) -> Vec<(SessionId, ActiveSession)> {
        self.active.write().await.drain().collect()
    }

    pub async fn active_len(&self) -> usize {
        self.active.read().await.len()
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.read().await.len()
    }
}
