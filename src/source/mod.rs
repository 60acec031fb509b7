//! Landmark frame ingestion for the posture agent.
//!
//! The pose-estimation model is an external collaborator; this module only
//! defines the frame contract and a stdin-backed source that receives frames
//! from it as a lazy, unbounded stream.

pub mod stdin;
pub mod types;

pub use stdin::{SourceError, StdinFrameSource};
pub use types::{Landmark, LandmarkFrame};
