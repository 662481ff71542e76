//! Skylink transfer engine - client coordinator and jailed file server
//!
//! This crate provides:
//! - [`FtpClient`]: one operation at a time over a lossy datagram link, with
//!   per-request retries, burst downloads and progress callbacks
//! - [`FtpServer`]: answers requests against a jailed root directory
//! - [`ServerComponent`]: lifecycle and fan-out for server capabilities
//! - Transports: in-memory channels for tests, UDP for real links
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  FtpClient (public API, *_async callbacks / async fns)       │
//! │  one active slot ── Busy if taken                            │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ spawn
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Operation task                                              │
//! │  Session FSM · Outstanding request (timeout/retry)           │
//! │  BurstScheduler for downloads                                │
//! └──────────────┬──────────────────────────────▲────────────────┘
//!                │ Transport::send              │ mpsc (DriverEvent)
//!                ▼                              │
//!            link ────────▶ FtpServer ───▶ link ┴─ InboundSink
//! ```
//!
//! The engine never blocks on the link: frames go out through
//! [`Transport::send`] and come back through [`InboundSink::handle_inbound`].

pub mod burst;
pub mod client;
pub mod component;
pub(crate) mod operation;
pub mod progress;
pub mod retry;
pub mod server;
pub mod session;
pub mod stats;
pub mod transport;
pub mod udp;

pub use burst::{BurstScheduler, ChunkOutcome};
pub use client::FtpClient;
pub use component::{ServerCapability, ServerComponent};
pub use progress::{Completion, ProgressData, TransferCallback, TransferReporter};
pub use retry::{Expiry, Match, Outstanding, RetryPolicy, SequenceCounter};
pub use server::FtpServer;
pub use session::{OperationKind, Session, SessionState, TransitionError};
pub use stats::{ClientStats, ClientStatsSnapshot};
pub use transport::{
    channel, ChannelReceiver, ChannelTransport, InboundSink, LossPattern, LossyTransport,
    Transport, TransportError,
};
pub use udp::UdpTransport;
