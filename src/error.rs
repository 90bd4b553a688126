//! Error types.
//!
//! Input validation failures and communication failures are fatal to a decomposition
//! step. Degenerate trees and load imbalance are not errors; they are logged.

use thiserror::Error;

/// Failure of a collective or point-to-point transfer.
///
/// A partially received halo or migration set is unusable, so callers should abort
/// the run instead of retrying.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommError {
    /// A peer went away before a transfer completed.
    #[error("rank {peer} disconnected during communication")]
    Disconnected {
        /// The peer rank.
        peer: usize,
    },
    /// A received payload does not have the size the receiver planned for.
    #[error("payload from rank {peer} holds {actual} items, expected {expected}")]
    SizeMismatch {
        /// The sending rank.
        peer: usize,
        /// Planned number of items.
        expected: usize,
        /// Received number of items.
        actual: usize,
    },
    /// No message arrived from a peer within the transport's deadline.
    #[error("timed out waiting for rank {peer}")]
    Timeout {
        /// The peer rank.
        peer: usize,
    },
    /// A payload could not be decoded.
    #[error("malformed payload from rank {peer}: {reason}")]
    Malformed {
        /// The sending rank.
        peer: usize,
        /// What went wrong.
        reason: &'static str,
    },
    /// A buffer is too long for the transport's element count type.
    #[error("message of {len} bytes exceeds the transport limit")]
    MessageTooLarge {
        /// Buffer length in bytes.
        len: usize,
    },
    /// A peer rank outside the communicator.
    #[error("rank {peer} is outside a communicator of size {size}")]
    InvalidPeer {
        /// The requested peer.
        peer: usize,
        /// Communicator size.
        size: usize,
    },
}

/// Errors raised by the domain decomposition.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DomainError {
    /// A coordinate lies outside the box on an axis with open boundaries.
    #[error("coordinate {value} on axis {axis} is outside [{min}, {max}] of a non-periodic box")]
    PointOutsideBox {
        /// The axis (0, 1, 2).
        axis: usize,
        /// The offending coordinate.
        value: f64,
        /// Lower box bound.
        min: f64,
        /// Upper box bound.
        max: f64,
    },
    /// The bucket size must be positive.
    #[error("bucket size must be positive")]
    InvalidBucketSize,
    /// The number of ranks must be positive.
    #[error("rank count must be positive")]
    InvalidRankCount,
    /// The bounding box is empty or not finite.
    #[error("invalid bounding box: {0}")]
    InvalidBox(String),
    /// Particle arrays passed to the domain have different lengths.
    #[error("particle array `{name}` has length {actual}, expected {expected}")]
    LengthMismatch {
        /// Name of the array.
        name: &'static str,
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },
    /// The particles held by all ranks after migration do not add up to the global count.
    #[error("ranks hold {actual} particles after migration, expected {expected}")]
    ParticleCountMismatch {
        /// Global particle count of the tree.
        expected: u64,
        /// Sum of the local counts.
        actual: u64,
    },
    /// An invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Communication failed.
    #[error(transparent)]
    Comm(#[from] CommError),
}
