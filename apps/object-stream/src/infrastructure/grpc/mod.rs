//! gRPC Client
//!
//! Talks to the Cloud Storage v2 service over tonic.
//!
//! # Architecture
//!
//! - `proto`: hand-maintained prost messages for the streaming RPCs
//! - `codec`: request encoding plus zero-copy response framing
//! - `transport`: the [`StorageTransport`] adapter
//!
//! [`StorageTransport`]: crate::application::ports::StorageTransport

pub mod codec;
pub mod proto;
pub mod transport;

pub use codec::RawResponseCodec;
pub use transport::{TonicTransport, TransportError};
