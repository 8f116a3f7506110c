//! Streaming session lifecycle
//!
//! One `StreamController` per camera drives the per-session state machine
//! `None → Pending → Active → None` in response to negotiate, start,
//! reconfigure and stop events from the negotiation layer, plus the
//! process-wide shutdown. It is the only component that mutates the session
//! maps; supervisors and ports are owned through it.

use crate::command::{self, SnapshotRequest, VideoParams};
use crate::config::CameraConfig;
use crate::ports::{PortError, PortPool, Transport};
use crate::session::{
    ActiveSession, PendingSession, SessionStore, StreamCrypto, StreamEndpoint,
};
use crate::supervisor::{self, StartOptions, StreamSupervisor, SupervisorError, SupervisorState};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for a one-shot still capture
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Port(#[from] PortError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

pub type Result<T> = std::result::Result<T, ControllerError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[default]
    Ipv4,
    Ipv6,
}

/// Transport negotiation input from the controller side
#[derive(Debug, Clone)]
pub struct NegotiateRequest {
    pub controller_address: IpAddr,
    pub family: AddressFamily,
    pub video_crypto: StreamCrypto,
    pub audio_crypto: StreamCrypto,
}

/// Parameters for one stream as echoed back to the controller
#[derive(Debug, Clone)]
pub struct EndpointDescriptor {
    pub port: u16,
    pub ssrc: u32,
    pub crypto: StreamCrypto,
}

/// Everything the controller needs to address and decrypt the stream
#[derive(Debug, Clone)]
pub struct TransportDescriptor {
    pub address: IpAddr,
    pub video: EndpointDescriptor,
    pub audio: EndpointDescriptor,
}

/// Requested parameters accompanying a start event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub video: VideoParams,
    #[serde(default)]
    pub audio: Option<command::AudioParams>,
}

/// Lifecycle manager for one camera's streaming sessions
pub struct StreamController {
    config: CameraConfig,
    transcoder_bin: String,
    ports: Arc<PortPool>,
    sessions: Arc<SessionStore>,
}

impl StreamController {
    pub fn new(config: CameraConfig, transcoder_bin: String, ports: Arc<PortPool>) -> Self {
        Self {
            config,
            transcoder_bin,
            ports,
            sessions: Arc::new(SessionStore::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.active_len().await
    }

    /// Negotiate transport parameters for a new session.
    ///
    /// Reserves one return port and generates one synchronization source per
    /// stream type, stores the result as pending (replacing any prior
    /// pending record for the same id) and echoes the transport descriptor.
    pub async fn negotiate(&self, id: &str, req: NegotiateRequest) -> Result<TransportDescriptor> {
        let address = resolve_return_address(self.config.interface.as_deref(), req.family);
        let video_port = self.ports.reserve(Transport::Udp, address)?;
        let audio_port = self.ports.reserve(Transport::Udp, address)?;

        let pending = PendingSession {
            controller_addr: req.controller_address,
            video: StreamEndpoint {
                port: video_port,
                ssrc: generate_ssrc(),
                crypto: req.video_crypto,
            },
            audio: StreamEndpoint {
                port: audio_port,
                ssrc: generate_ssrc(),
                crypto: req.audio_crypto,
            },
        };

        let descriptor = TransportDescriptor {
            address,
            video: EndpointDescriptor {
                port: pending.video.port,
                ssrc: pending.video.ssrc,
                crypto: pending.video.crypto.clone(),
            },
            audio: EndpointDescriptor {
                port: pending.audio.port,
                ssrc: pending.audio.ssrc,
                crypto: pending.audio.crypto.clone(),
            },
        };

        if self.sessions.put_pending(id, pending).await.is_some() {
            log::debug!("[{}] replaced pending session {}", self.config.name, id);
        }
        log::info!(
            "[{}] negotiated session {} (video port {}, audio port {})",
            self.config.name,
            id,
            video_port,
            audio_port
        );
        Ok(descriptor)
    }

    /// Start streaming a previously negotiated session.
    ///
    /// Without a matching pending record this is a no-op: duplicate or late
    /// start requests must not launch anything.
    pub async fn start(&self, id: &str, req: StartRequest) -> Result<()> {
        let Some(pending) = self.sessions.take_pending(id).await else {
            log::debug!(
                "[{}] start for session {} with no pending record, ignoring",
                self.config.name,
                id
            );
            return Ok(());
        };

        let audio = if self.config.audio {
            req.audio.as_ref()
        } else {
            None
        };
        let args = command::stream_args(&self.config, &pending, &req.video, audio);
        let label = format!("{}/{}", self.config.name, id);
        let opts = StartOptions {
            debug: self.config.debug,
            ..Default::default()
        };
        let supervisor = StreamSupervisor::start(&self.transcoder_bin, &args, &label, opts)?;
        let mut state_rx = supervisor.watch_state();

        self.sessions
            .insert_active(
                id,
                ActiveSession {
                    supervisor,
                    video_port: pending.video.port,
                },
            )
            .await;
        log::info!("[{}] stream starting", label);

        // One-way failure path: a dead transcoder tears its session down,
        // the negotiation layer hears nothing until it asks again
        let sessions = self.sessions.clone();
        let camera = self.config.name.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            loop {
                if state_rx.changed().await.is_err() {
                    break;
                }
                let state = *state_rx.borrow();
                match state {
                    SupervisorState::Failed => {
                        if sessions.remove_active(&id).await.is_some() {
                            log::warn!("[{}/{}] transcoder failed, session removed", camera, id);
                        }
                        break;
                    }
                    SupervisorState::Stopped => break,
                    _ => {}
                }
            }
        });

        Ok(())
    }

    /// Acknowledge a reconfigure request without touching the live stream.
    /// Mid-stream renegotiation is deliberately not applied.
    pub async fn reconfigure(&self, id: &str, params: &serde_json::Value) {
        log::info!(
            "[{}] reconfigure requested for session {} (not applied): {}",
            self.config.name,
            id,
            params
        );
    }

    /// Tear down a session in whatever state it is in.
    ///
    /// Safe to call with no matching record; never an error.
    pub async fn stop(&self, id: &str) {
        if let Some(active) = self.sessions.remove_active(id).await {
            active.supervisor.stop().await;
            log::info!("[{}] stream {} stopped", self.config.name, id);
            return;
        }
        if self.sessions.take_pending(id).await.is_some() {
            log::debug!(
                "[{}] discarded pending session {} before start",
                self.config.name,
                id
            );
            return;
        }
        log::debug!(
            "[{}] stop for unknown session {}, ignoring",
            self.config.name,
            id
        );
    }

    /// Stop every active session once; called when the daemon terminates
    pub async fn shutdown(&self) {
        let drained = self.sessions.drain_active().await;
        if drained.is_empty() {
            return;
        }
        log::info!(
            "[{}] shutting down {} active session(s)",
            self.config.name,
            drained.len()
        );
        for (id, active) in drained {
            active.supervisor.stop().await;
            log::debug!("[{}] stream {} stopped on shutdown", self.config.name, id);
        }
    }

    /// Capture a single still frame
    pub async fn snapshot(&self, req: SnapshotRequest) -> Result<Vec<u8>> {
        let args = command::snapshot_args(&self.config, &req);
        let bytes = supervisor::capture_frame(&self.transcoder_bin, &args, SNAPSHOT_TIMEOUT).await?;
        log::debug!(
            "[{}] captured snapshot ({} bytes)",
            self.config.name,
            bytes.len()
        );
        Ok(bytes)
    }
}

fn generate_ssrc() -> u32 {
    rand::thread_rng().gen_range(1..=u32::MAX)
}

/// Resolve the return address for the configured interface.
///
/// Resolution failure is recoverable: the controller can still reach us on
/// the default route, so fall back to the unspecified address and log.
fn resolve_return_address(interface: Option<&str>, family: AddressFamily) -> IpAddr {
    if let Some(name) = interface {
        match nix::ifaddrs::getifaddrs() {
            Ok(addrs) => {
                for ifaddr in addrs {
                    if ifaddr.interface_name != name {
                        continue;
                    }
                    let Some(address) = ifaddr.address else {
                        continue;
                    };
                    match family {
                        AddressFamily::Ipv4 => {
                            if let Some(sin) = address.as_sockaddr_in() {
                                return IpAddr::V4(sin.ip());
                            }
                        }
                        AddressFamily::Ipv6 => {
                            if let Some(sin6) = address.as_sockaddr_in6() {
                                return IpAddr::V6(sin6.ip());
                            }
                        }
                    }
                }
                log::warn!(
                    "no {:?} address on interface '{}', falling back to default interface",
                    family,
                    name
                );
            }
            Err(e) => {
                log::warn!(
                    "failed to enumerate interfaces ({}), falling back to default interface",
                    e
                );
            }
        }
    }
    match family {
        AddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        AddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_ssrc_is_nonzero() {
        for _ in 0..64 {
            assert_ne!(generate_ssrc(), 0);
        }
    }

    #[test]
    fn test_unknown_interface_falls_back_to_unspecified() {
        let addr = resolve_return_address(Some("does-not-exist0"), AddressFamily::Ipv4);
        assert_eq!(addr, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let addr = resolve_return_address(Some("does-not-exist0"), AddressFamily::Ipv6);
        assert_eq!(addr, IpAddr::V6(Ipv6Addr::UNSPECIFIED));
    }

    #[test]
    fn test_no_interface_configured_uses_default() {
        let addr = resolve_return_address(None, AddressFamily::Ipv4);
        assert_eq!(addr, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }
}
