//! Camrelay
//!
//! Bridges IP cameras to SRTP stream controllers: negotiates per-session
//! transport parameters, drives an external transcoder process for the
//! actual media relay, and supervises it for the session's duration.

pub mod command;
pub mod config;
pub mod controller;
pub mod http_server;
pub mod ports;
pub mod session;
pub mod supervisor;

pub use config::{CameraConfig, Config, ConfigError};
pub use controller::{NegotiateRequest, StartRequest, StreamController, TransportDescriptor};
pub use http_server::{run_http_server, AppState};
pub use ports::{PortPool, Transport};
pub use supervisor::{StreamSupervisor, SupervisorState};
