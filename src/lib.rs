//! cftun - userspace TUN client for a WebSocket edge
//!
//! # Architecture
//!
//! ```text
//! Device (TUN)
//! → NativeStack (IP/TCP/UDP demultiplexing)
//! → Tunnel (flow dispatch, one task per flow)
//! → Dialer (connection pool)
//! → Session (TLS/WebSocket)
//! → Transport (TCP)
//! ```
//!
//! ## Core Principles
//!
//! - Each layer does ONE thing
//! - Layers meet at traits: Device, TransportHandler, Dialer, Session, Transport
//! - Edge streams carry their destination as Metadata
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Stream, Metadata, Address, EndpointId
//! ├── device/          # Virtual interfaces
//! ├── stack/           # Packet parsing, flow events, UDP sessions
//! ├── transport/       # TCP transport, edge connector, pool
//! ├── session/         # Session layer: TLS, WebSocket
//! └── app/             # Application: Tunnel, Engine, Runtime, metrics
//! ```

// Core types
pub mod common;
pub mod error;

// Layered architecture
pub mod device;
pub mod stack;
pub mod transport;
pub mod session;
pub mod app;

// Supporting modules
pub mod config;

// Re-exports for convenience
pub use common::{Address, EndpointId, Metadata, Network, Stream};
pub use config::Config;
pub use error::{Error, Result};

// Architecture re-exports
pub use app::{Engine, Runtime, Tunnel};
pub use device::Device;
pub use session::Session;
pub use stack::{NativeStack, TransportHandler};
pub use transport::{Dialer, PooledDialer, Transport};
