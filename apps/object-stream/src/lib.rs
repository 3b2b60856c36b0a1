#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::cast_possible_truncation
    )
)]

//! Object Stream - Cloud Storage gRPC Streaming Client
//!
//! Reads and writes Cloud Storage objects over the v2 gRPC streaming
//! RPCs. Reads decode responses without copying object content; writes
//! buffer until the server has persisted each chunk so a broken stream
//! resumes where the server left off.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Object identity and range arithmetic
//!   - `object`: specs, preconditions, encryption keys, handles
//!   - `range`: offset/length resolution and read ids
//!
//! - **Application**: Streaming services and the transport port
//!   - `ports`: `StorageTransport`, the four RPCs the services need
//!   - `services`: range reader, multi-range downloader, object writer
//!
//! - **Infrastructure**: Adapters and plumbing
//!   - `grpc`: tonic transport and raw response codec
//!   - `memory`: in-process emulation for tests and demos
//!   - `wire`: zero-copy `BidiReadObjectResponse` decoder
//!   - `retry`: backoff and redirect detail extraction
//!   - `config`, `telemetry`, `metrics`: ambient stack
//!
//! # Data Flow
//!
//! ```text
//!                  ┌───────────────┐   BufferSlice   ┌──────────────┐
//! StorageTransport │ BidiReadObject│────────────────►│ wire decoder │──► RangeReader
//!   (tonic or      └───────────────┘                 └──────────────┘──► MultiRangeDownloader
//!    in-memory)    ┌───────────────┐
//!                  │BidiWriteObject│◄──────────────────────────────────── ObjectWriter
//!                  └───────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Object identity and range arithmetic.
pub mod domain;

/// Application layer - Streaming services and port definitions.
pub mod application;

/// Infrastructure layer - Transports and ambient plumbing.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::object::{Conditions, EncryptionKey, ObjectSpec, ReadHandle, WriteHandle};
pub use domain::range::RangeRequest;

// Application services
pub use application::error::StorageError;
pub use application::ports::{RequestParams, StorageTransport};
pub use application::services::{
    CallSettings, MultiRangeDownloader, ObjectHandle, ObjectWriter, PendingRange, RangeOutcome,
    RangeReader, ReaderAttrs, StorageClient, WriterOptions,
};

// Infrastructure
pub use infrastructure::config::{ClientConfig, ConfigError};
pub use infrastructure::grpc::TonicTransport;
pub use infrastructure::memory::{Fault, InMemoryTransport};
pub use infrastructure::metrics::{get_metrics_handle, init_metrics};
pub use infrastructure::retry::BackoffConfig;
