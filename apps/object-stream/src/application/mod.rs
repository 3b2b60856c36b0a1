//! Application Layer - Streaming services and their ports.
//!
//! Readers and writers are written against the [`ports::StorageTransport`]
//! port and never touch tonic directly.

/// Error type shared by the streaming services.
pub mod error;

/// Port interfaces for storage backends.
pub mod ports;

/// Range reader, multi-range downloader, object writer and client.
pub mod services;
