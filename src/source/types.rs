//! Landmark frame types consumed by the posture pipeline.
//!
//! Frames are ephemeral: they are consumed by the angle computer as soon as
//! they arrive and never persisted or transmitted. Only derived daily
//! aggregates ever leave this process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single body keypoint in normalized image coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f64,
    pub y: f64,
    /// Depth estimate, when the upstream model provides one.
    #[serde(default)]
    pub z: f64,
    /// Model confidence that the landmark is actually in frame (0-1).
    #[serde(default = "default_visibility")]
    pub visibility: f64,
}

fn default_visibility() -> f64 {
    1.0
}

impl Landmark {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            z: 0.0,
            visibility: 1.0,
        }
    }

    /// Midpoint between two landmarks, with the lower of the two visibilities.
    pub fn midpoint(a: &Landmark, b: &Landmark) -> Landmark {
        Landmark {
            x: (a.x + b.x) / 2.0,
            y: (a.y + b.y) / 2.0,
            z: (a.z + b.z) / 2.0,
            visibility: a.visibility.min(b.visibility),
        }
    }
}

/// One timestamped snapshot of the body landmarks the posture metric needs.
///
/// Any landmark the upstream pose model failed to resolve is `None`; the
/// angle computer drops such frames rather than treating them as errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LandmarkFrame {
    /// Capture timestamp. Producers must deliver frames with monotonically
    /// non-decreasing timestamps within a session.
    pub timestamp: DateTime<Utc>,
    pub left_shoulder: Option<Landmark>,
    pub right_shoulder: Option<Landmark>,
    pub left_ear: Option<Landmark>,
    pub right_ear: Option<Landmark>,
}

impl LandmarkFrame {
    /// Create a frame with all four landmarks present at full visibility.
    pub fn new(
        timestamp: DateTime<Utc>,
        left_shoulder: Landmark,
        right_shoulder: Landmark,
        left_ear: Landmark,
        right_ear: Landmark,
    ) -> Self {
        Self {
            timestamp,
            left_shoulder: Some(left_shoulder),
            right_shoulder: Some(right_shoulder),
            left_ear: Some(left_ear),
            right_ear: Some(right_ear),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_midpoint() {
        let a = Landmark::new(0.0, 0.0);
        let b = Landmark::new(2.0, 4.0);
        let mid = Landmark::midpoint(&a, &b);
        assert_eq!(mid.x, 1.0);
        assert_eq!(mid.y, 2.0);
    }

    #[test]
    fn test_frame_deserializes_with_missing_landmarks() {
        let json = r#"{"timestamp":"2024-03-05T12:00:00Z","left_shoulder":{"x":0.4,"y":0.6},"right_shoulder":null,"left_ear":null,"right_ear":null}"#;
        let frame: LandmarkFrame = serde_json::from_str(json).unwrap();
        assert!(frame.left_shoulder.is_some());
        assert!(frame.right_shoulder.is_none());
        assert_eq!(frame.left_shoulder.unwrap().visibility, 1.0);
    }
}
