//! Real-time collaboration for the Wolf Auto Marketer dashboard.
//!
//! Client side: a [`ConnectionManager`] keeps one reconnecting WebSocket,
//! [`Session`]s scope subscriptions to their owner, and
//! [`presence::CollaborationView`] folds the event stream into a roster,
//! an activity log and a chat list.
//!
//! Server side: [`server::serve`] accepts upgrades and hands them to the
//! [`relay`] hub, which greets, fans out and resyncs the roster.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod listeners;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;
pub mod transport;

pub use client::{ConnectOutcome, ConnectionManager, ConnectionState, ConnectionStats};
pub use config::{AppConfig, ClientConfig, ManualConnect, ReconnectPolicy, ServerConfig};
pub use error::{CollabError, Result};
pub use listeners::Subscription;
pub use protocol::{Inbound, WireMessage};
pub use session::{Session, SessionEvent, SessionOptions};
