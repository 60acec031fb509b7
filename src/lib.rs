//! Posture Agent - Privacy-first forward-head-posture tracker.
//!
//! This library turns a live stream of body-landmark frames into weighted
//! daily posture summaries and reconciles them with a remote store under
//! unreliable network conditions.
//!
//! # Privacy Guarantees
//!
//! - **No raw frames leave the device**: landmark coordinates are consumed
//!   immediately and discarded after angle computation
//! - **No per-sample transmission**: only daily aggregate totals are synced
//! - **Transparency**: all measurement and sync activity is counted and
//!   auditable
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Posture Agent                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌──────────┐   ┌──────────┐   ┌────────────┐   ┌────────┐  │
//! │  │  Frame   │──▶│  Angle   │──▶│   Daily    │──▶│ Local  │  │
//! │  │  Source  │   │ Computer │   │ Aggregator │   │ Store  │  │
//! │  └──────────┘   └──────────┘   └────────────┘   └────────┘  │
//! │                                                      │       │
//! │                                ┌────────────┐        ▼       │
//! │                                │   Remote   │◀── Scheduler   │
//! │                                │   Store    │                │
//! │                                └────────────┘                │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use posture_agent::{core, source};
//!
//! // Frames arrive from the out-of-process pose model via stdin
//! let mut frames = source::StdinFrameSource::new();
//! frames.start().expect("Failed to start frame source");
//!
//! let mut angles = core::AngleComputer::new(15.0, 0.0, 0.5, 5.0, 0.5);
//! let mut aggregator = core::LocalAggregator::new("device-1", chrono_tz::UTC);
//!
//! for frame in frames.receiver().iter() {
//!     if let Some(sample) = angles.process(&frame) {
//!         aggregator.fold(&sample);
//!     }
//! }
//! ```

pub mod config;
pub mod core;
pub mod remote;
pub mod source;
pub mod stats;
pub mod store;
pub mod sync;

// Re-export key types at crate root for convenience
pub use config::Config;
pub use core::{AngleComputer, AngleSample, DailyAggregate, LocalAggregator, SyncState};
pub use remote::{
    BlockingRemoteClient, FailureKind, RemoteClient, RemoteConfig, RemoteError, UpsertResponse,
};
pub use source::{Landmark, LandmarkFrame, StdinFrameSource};
pub use stats::{AgentStats, SharedStats, StatsSnapshot};
pub use store::{LocalStore, StoreError};
pub use sync::{FlushReport, RetryPolicy, SyncScheduler};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Privacy declaration that can be displayed to users.
pub const PRIVACY_DECLARATION: &str = r#"
╔══════════════════════════════════════════════════════════════════╗
║             POSTURE AGENT - PRIVACY DECLARATION                  ║
╠══════════════════════════════════════════════════════════════════╣
║                                                                  ║
║  This agent measures forward-head posture from body landmarks.   ║
║                                                                  ║
║  ✓ WHAT WE KEEP AND SEND:                                        ║
║    • One weighted posture total per calendar day                 ║
║    • How many seconds of posture were observed                   ║
║    • How many samples were measured                              ║
║                                                                  ║
║  ✗ WHAT WE NEVER STORE OR TRANSMIT:                              ║
║    • Camera images (the agent never sees them)                   ║
║    • Raw landmark coordinates (discarded after each frame)       ║
║    • Per-sample measurements or timestamps                       ║
║                                                                  ║
║  All measurement happens locally. Only the daily aggregate       ║
║  leaves this device, over an authenticated connection.           ║
║                                                                  ║
║  You can view collection statistics anytime with:                ║
║    posture-agent status                                          ║
║                                                                  ║
╚══════════════════════════════════════════════════════════════════╝
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_privacy_declaration_contents() {
        assert!(PRIVACY_DECLARATION.contains("PRIVACY"));
        assert!(PRIVACY_DECLARATION.contains("NEVER STORE OR TRANSMIT"));
        assert!(PRIVACY_DECLARATION.contains("landmark coordinates"));
    }
}
