//! Common types and abstractions
//!
//! This module defines the core types used throughout the application:
//! - Stream: unified async I/O abstraction
//! - Metadata: destination context forwarded to the remote edge
//! - Address: network address representation
//! - EndpointId: the 4-tuple identifying a captured flow
//! - Error: unified error types

mod address;
mod endpoint;
mod metadata;
mod stream;

pub use address::Address;
pub use endpoint::EndpointId;
pub use metadata::{Metadata, Network};
pub use stream::{AsyncReadWrite, Stream};

// Re-export error types from crate root
pub use crate::error::{Error, Result};
