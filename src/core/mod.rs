//! Core posture measurement and aggregation.
//!
//! This module contains:
//! - Angle computation: landmark frames become classified posture samples
//! - Daily aggregation: samples fold into per-day weighted aggregates

pub mod aggregate;
pub mod angle;

// Re-export commonly used types
pub use aggregate::{DailyAggregate, LocalAggregator, SyncState};
pub use angle::{AngleComputer, AngleSample};
