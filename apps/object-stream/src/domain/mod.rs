//! Domain Layer - Object identity and range arithmetic.
//!
//! Pure types with no I/O: what an operation targets and which bytes it
//! covers.

/// Object specs, preconditions, encryption keys and handles.
pub mod object;

/// Range resolution and read-id allocation.
pub mod range;
