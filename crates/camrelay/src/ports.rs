//! Ephemeral port reservation
//!
//! Negotiation hands out return ports before any socket is actually opened
//! by the transcoder, so concurrently-negotiating sessions could otherwise
//! be given the same port. The pool probes the OS for a free port and
//! remembers it for a bounded window; entries expire on their own so an
//! abandoned negotiation can never exhaust the port space.

use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// How long a reservation shields a port from being handed out again.
/// Policy, not protocol: long enough for the slowest negotiate→start cycle.
const RESERVATION_TTL: Duration = Duration::from_secs(60);

/// Probe attempts before giving up on a reservation request
const MAX_PROBES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Udp => write!(f, "udp"),
            Transport::Tcp => write!(f, "tcp"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("no free {transport} port on {addr} after {MAX_PROBES} probes")]
    NoPortAvailable { transport: Transport, addr: IpAddr },
}

pub type Result<T> = std::result::Result<T, PortError>;

#[derive(Debug)]
struct Reservation {
    transport: Transport,
    addr: IpAddr,
    port: u16,
    expires_at: Instant,
}

/// Process-wide table of recently reserved ports
#[derive(Debug)]
pub struct PortPool {
    reserved: Mutex<Vec<Reservation>>,
    ttl: Duration,
}

impl PortPool {
    pub fn new() -> Self {
        Self::with_ttl(RESERVATION_TTL)
    }

    /// Pool with a custom reservation window
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            reserved: Mutex::new(Vec::new()),
            ttl,
        }
    }

    /// Reserve a port known to be free at call time.
    ///
    /// The reservation is a short-lived claim, not a bind: callers must use
    /// the port before the window lapses or renegotiate.
    pub fn reserve(&self, transport: Transport, addr: IpAddr) -> Result<u16> {
        let mut reserved = self
            .reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        reserved.retain(|r| r.expires_at > now);

        for _ in 0..MAX_PROBES {
            let Some(port) = probe(transport, addr) else {
                continue;
            };
            let taken = reserved
                .iter()
                .any(|r| r.transport == transport && r.addr == addr && r.port == port);
            if taken {
                continue;
            }
            reserved.push(Reservation {
                transport,
                addr,
                port,
                expires_at: now + self.ttl,
            });
            return Ok(port);
        }

        Err(PortError::NoPortAvailable { transport, addr })
    }

    /// Whether a port is currently inside a live reservation window
    pub fn is_reserved(&self, transport: Transport, addr: IpAddr, port: u16) -> bool {
        let mut reserved = self
            .reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        reserved.retain(|r| r.expires_at > now);
        reserved
            .iter()
            .any(|r| r.transport == transport && r.addr == addr && r.port == port)
    }
}

impl Default for PortPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Ask the OS for a free port by binding to port 0 and releasing it
fn probe(transport: Transport, addr: IpAddr) -> Option<u16> {
    match transport {
        Transport::Udp => {
            let socket = std::net::UdpSocket::bind((addr, 0)).ok()?;
            Some(socket.local_addr().ok()?.port())
        }
        Transport::Tcp => {
            let listener = std::net::TcpListener::bind((addr, 0)).ok()?;
            Some(listener.local_addr().ok()?.port())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[test]
    fn test_reserve_returns_distinct_ports() {
        let pool = PortPool::new();
        let a = pool.reserve(Transport::Udp, localhost()).unwrap();
        let b = pool.reserve(Transport::Udp, localhost()).unwrap();
        assert_ne!(a, b);
        assert!(pool.is_reserved(Transport::Udp, localhost(), a));
        assert!(pool.is_reserved(Transport::Udp, localhost(), b));
    }

    #[test]
    fn test_reservation_is_transport_scoped() {
        let pool = PortPool::new();
        let port = pool.reserve(Transport::Udp, localhost()).unwrap();
        assert!(!pool.is_reserved(Transport::Tcp, localhost(), port));
    }

    #[test]
    fn test_reservation_expires() {
        let pool = PortPool::with_ttl(Duration::from_millis(20));
        let port = pool.reserve(Transport::Udp, localhost()).unwrap();
        assert!(pool.is_reserved(Transport::Udp, localhost(), port));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!pool.is_reserved(Transport::Udp, localhost(), port));
    }

    #[test]
    fn test_concurrent_reservations_do_not_collide() {
        let pool = std::sync::Arc::new(PortPool::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                pool.reserve(Transport::Udp, localhost()).unwrap()
            }));
        }
        let mut ports: Vec<u16> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 8);
    }
}
