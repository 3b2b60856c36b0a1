//! Prometheus Metrics Module
//!
//! Counters and histograms for the streaming paths.
//!
//! # Metrics Categories
//!
//! - **Throughput**: bytes delivered to readers and persisted by writers
//! - **Resilience**: stream reopens and retry pauses per operation
//! - **Ranges**: multi-range completions by result
//! - **Latency**: flush round trips
//!
//! Recording is a no-op until a recorder is installed; the binary installs
//! the Prometheus recorder and renders it with `--metrics`.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder, or return the already installed one.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "object_stream_bytes_read_total",
        "Object bytes delivered to readers"
    );
    describe_counter!(
        "object_stream_bytes_written_total",
        "Object bytes acknowledged as persisted"
    );
    describe_counter!(
        "object_stream_reopens_total",
        "Streams reopened after a transient failure or redirect"
    );
    describe_counter!(
        "object_stream_retries_total",
        "Backoff pauses taken before another attempt"
    );
    describe_counter!(
        "object_stream_checksum_mismatches_total",
        "Received chunks or objects whose CRC32C did not match"
    );
    describe_counter!(
        "object_stream_ranges_completed_total",
        "Multi-range downloads completed by result"
    );
    describe_gauge!(
        "object_stream_active_ranges",
        "Ranges outstanding on multi-range downloaders"
    );
    describe_histogram!(
        "object_stream_flush_seconds",
        "Time from sending a flush to receiving the persisted size"
    );
}

// =============================================================================
// Metric Labels
// =============================================================================

/// Streaming operation label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Single-range read stream.
    Read,
    /// Multi-range read stream.
    MultiRangeRead,
    /// Write stream.
    Write,
    /// `StartResumableWrite` call.
    StartResumableWrite,
    /// `QueryWriteStatus` call.
    QueryWriteStatus,
}

impl Operation {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::MultiRangeRead => "multi_range_read",
            Self::Write => "write",
            Self::StartResumableWrite => "start_resumable_write",
            Self::QueryWriteStatus => "query_write_status",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome label for a completed range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeResult {
    /// All bytes delivered.
    Ok,
    /// Server or stream failure.
    Failed,
    /// Sink rejected a write.
    SinkError,
    /// Downloader closed before the range finished.
    Closed,
}

impl RangeResult {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Failed => "failed",
            Self::SinkError => "sink_error",
            Self::Closed => "closed",
        }
    }
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record object bytes handed to a reader or sink.
pub fn record_bytes_read(operation: Operation, bytes: u64) {
    counter!(
        "object_stream_bytes_read_total",
        "operation" => operation.as_str()
    )
    .increment(bytes);
}

/// Record bytes newly acknowledged as persisted.
pub fn record_bytes_written(bytes: u64) {
    counter!("object_stream_bytes_written_total").increment(bytes);
}

/// Record a stream reopen.
pub fn record_reopen(operation: Operation) {
    counter!(
        "object_stream_reopens_total",
        "operation" => operation.as_str()
    )
    .increment(1);
}

/// Record a retry pause.
pub fn record_retry(operation: Operation) {
    counter!(
        "object_stream_retries_total",
        "operation" => operation.as_str()
    )
    .increment(1);
}

/// Record a CRC32C mismatch.
pub fn record_checksum_mismatch(operation: Operation) {
    counter!(
        "object_stream_checksum_mismatches_total",
        "operation" => operation.as_str()
    )
    .increment(1);
}

/// Record a finished range.
pub fn record_range_completed(result: RangeResult) {
    counter!(
        "object_stream_ranges_completed_total",
        "result" => result.as_str()
    )
    .increment(1);
}

/// Adjust the outstanding range gauge.
pub fn add_active_ranges(delta: f64) {
    gauge!("object_stream_active_ranges").increment(delta);
}

/// Record a flush round trip.
pub fn record_flush_duration(duration: Duration) {
    histogram!("object_stream_flush_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
