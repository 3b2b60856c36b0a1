//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the transport port plus the wire decoder,
//! retry policy and observability plumbing the services rely on.

/// Configuration loaded from the environment.
pub mod config;

/// gRPC transport to the storage service.
pub mod grpc;

/// In-process storage emulation.
pub mod memory;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Backoff and retryable-status classification.
pub mod retry;

/// OpenTelemetry tracing integration.
pub mod telemetry;

/// Zero-copy response decoding.
pub mod wire;
