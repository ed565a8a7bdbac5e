//! # Pulse Channel
//!
//! Real-time event-channel core for the operations dashboard: reconnecting
//! WebSocket connections with heartbeats, typed dispatch of tagged JSON
//! messages, and a keyed registry that keeps one socket per logical
//! channel.
//!
//! ## Features
//!
//! - **Connection lifecycle**: fixed-interval reconnection with an attempt
//!   cap and JSON heartbeats while connected
//! - **Typed dispatch**: every message is delivered as `message`, then under
//!   its `type` tag with the body only
//! - **Shared channels**: one socket per room or stream, handed out as
//!   handles that cannot sever the connection for other consumers
//! - **Consumer adapters**: drop guards for mount/unmount lifetimes and async
//!   event streams
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pulse_channel::{ChannelKey, ChannelRegistry, Event, RegistryConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = ChannelRegistry::new(
//!         RegistryConfig::new("wss://dash.example.com/ws").credentials("opaque-token"),
//!     )?;
//!
//!     let room = registry.get_service(&ChannelKey::conversation("lobby").with_tenant("acme"))?;
//!     let _typing = room.subscribe("typing", |event: &Event| {
//!         println!("typing: {:?}", event.field("user_id"));
//!     });
//!
//!     let mut updates = room.listen(["chat_message"]);
//!     while let Some(event) = updates.next().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod manager;
pub mod message;
pub mod registry;
pub mod transport;

// Re-export commonly used types
pub use config::ChannelConfig;
pub use dispatcher::{EventDispatcher, EventStream, Handler, HandlerId, Subscription};
pub use error::{ChannelError, ChannelResult};
pub use event::{Event, EventName};
pub use lifecycle::{ConnectionEpoch, ConnectionState};
pub use manager::{ConnectionManager, WeakConnectionManager};
pub use message::{Envelope, Message, MessageType};
pub use registry::{ChannelKey, ChannelKind, ChannelRegistry, RegistryConfig, SharedChannel};
pub use transport::{Connector, Frame, FrameSink, FrameStream, Socket, TungsteniteConnector};
