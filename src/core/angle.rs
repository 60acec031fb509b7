//! Forward-head-posture angle computation.
//!
//! Each landmark frame yields at most one [`AngleSample`]: the angle between
//! the shoulder-midpoint-to-ear vector and the vertical axis, expressed as a
//! deviation from a calibrated neutral angle. Frames with missing or
//! low-confidence landmarks are dropped, not errored.

use crate::source::types::{Landmark, LandmarkFrame};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A classified posture measurement derived from one accepted frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AngleSample {
    /// Capture timestamp of the originating frame.
    pub timestamp: DateTime<Utc>,
    /// Raw angle between the shoulder-to-ear vector and vertical, in degrees.
    pub angle_degrees: f64,
    /// Departure from the calibrated neutral angle, in degrees.
    pub deviation_degrees: f64,
    /// Whether the deviation exceeds the configured threshold.
    pub is_forward_head_posture: bool,
    /// Seconds of elapsed time this sample represents. Aggregation weights by
    /// elapsed time, not frame count, so variable frame rates and dropped
    /// frames do not skew the daily average.
    pub weight_secs: f64,
}

/// Computes posture samples from landmark frames.
///
/// Pure with respect to everything except the previous-accepted-frame
/// timestamp, which is needed to attribute a temporal weight to each sample.
#[derive(Debug, Clone)]
pub struct AngleComputer {
    /// Deviation above this many degrees classifies as forward head posture.
    /// Controls sensitivity; the default was chosen empirically.
    threshold_degrees: f64,
    /// Calibrated neutral angle. Zero until a calibration has run.
    neutral_angle_degrees: f64,
    /// Landmarks below this visibility make the frame unusable.
    min_visibility: f64,
    /// A gap above this many seconds is a session break: the weight baseline
    /// resets instead of attributing the whole gap to one sample.
    session_gap_secs: f64,
    /// Weight assigned to the first sample of a session (or after a break).
    resume_weight_secs: f64,
    /// Timestamp of the previous accepted frame, if within the session.
    last_accepted_at: Option<DateTime<Utc>>,
}

impl AngleComputer {
    pub fn new(
        threshold_degrees: f64,
        neutral_angle_degrees: f64,
        min_visibility: f64,
        session_gap_secs: f64,
        resume_weight_secs: f64,
    ) -> Self {
        Self {
            threshold_degrees,
            neutral_angle_degrees,
            min_visibility,
            session_gap_secs,
            resume_weight_secs,
            last_accepted_at: None,
        }
    }

    /// Process one frame. Returns `None` when the frame is unusable
    /// (missing landmarks, low confidence, or timestamp regression).
    pub fn process(&mut self, frame: &LandmarkFrame) -> Option<AngleSample> {
        let angle_degrees = self.raw_angle(frame)?;

        // Late out-of-order frames would double-count time already
        // attributed to a newer sample; reject them.
        if let Some(last) = self.last_accepted_at {
            if frame.timestamp < last {
                return None;
            }
        }

        let weight_secs = match self.last_accepted_at {
            Some(last) => {
                let gap = (frame.timestamp - last).num_milliseconds() as f64 / 1000.0;
                if gap > self.session_gap_secs {
                    // Session break (camera occluded, app backgrounded):
                    // reset the baseline rather than let one sample carry
                    // the whole pause.
                    self.resume_weight_secs
                } else {
                    gap
                }
            }
            None => self.resume_weight_secs,
        };

        self.last_accepted_at = Some(frame.timestamp);

        let deviation_degrees = angle_degrees - self.neutral_angle_degrees;
        Some(AngleSample {
            timestamp: frame.timestamp,
            angle_degrees,
            deviation_degrees,
            is_forward_head_posture: deviation_degrees > self.threshold_degrees,
            weight_secs,
        })
    }

    /// Raw shoulder-to-ear angle in degrees, ignoring weight bookkeeping.
    /// Used directly during calibration.
    pub fn raw_angle(&self, frame: &LandmarkFrame) -> Option<f64> {
        let ls = frame.left_shoulder.as_ref()?;
        let rs = frame.right_shoulder.as_ref()?;
        let le = frame.left_ear.as_ref()?;
        let re = frame.right_ear.as_ref()?;

        let shoulder = Landmark::midpoint(ls, rs);
        let ear = Landmark::midpoint(le, re);

        if shoulder.visibility < self.min_visibility || ear.visibility < self.min_visibility {
            return None;
        }

        // Image coordinates: y grows downward, so the ear sitting above the
        // shoulder gives a positive vertical component.
        let horizontal = (ear.x - shoulder.x).hypot(ear.z - shoulder.z);
        let vertical = shoulder.y - ear.y;

        let angle = horizontal.atan2(vertical).to_degrees();
        angle.is_finite().then_some(angle)
    }

    /// Forget the previous-frame timestamp, forcing the next sample to start
    /// a fresh session.
    pub fn reset_session(&mut self) {
        self.last_accepted_at = None;
    }

    pub fn set_neutral_angle(&mut self, degrees: f64) {
        self.neutral_angle_degrees = degrees;
    }

    pub fn neutral_angle(&self) -> f64 {
        self.neutral_angle_degrees
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn ts(offset_ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap() + Duration::milliseconds(offset_ms)
    }

    fn upright_frame(offset_ms: i64) -> LandmarkFrame {
        // Ears directly above shoulders: zero angle.
        LandmarkFrame::new(
            ts(offset_ms),
            Landmark::new(0.4, 0.6),
            Landmark::new(0.6, 0.6),
            Landmark::new(0.4, 0.4),
            Landmark::new(0.6, 0.4),
        )
    }

    fn leaning_frame(offset_ms: i64, lean_x: f64) -> LandmarkFrame {
        LandmarkFrame::new(
            ts(offset_ms),
            Landmark::new(0.4, 0.6),
            Landmark::new(0.6, 0.6),
            Landmark::new(0.4 + lean_x, 0.4),
            Landmark::new(0.6 + lean_x, 0.4),
        )
    }

    fn computer() -> AngleComputer {
        AngleComputer::new(15.0, 0.0, 0.5, 5.0, 0.5)
    }

    #[test]
    fn test_upright_is_zero_angle() {
        let mut c = computer();
        let sample = c.process(&upright_frame(0)).unwrap();
        assert!(sample.angle_degrees.abs() < 1e-9);
        assert!(!sample.is_forward_head_posture);
    }

    #[test]
    fn test_forward_lean_classified() {
        let mut c = computer();
        // Ear 0.2 forward, 0.2 above shoulder: 45 degrees.
        let sample = c.process(&leaning_frame(0, 0.2)).unwrap();
        assert!((sample.angle_degrees - 45.0).abs() < 1e-9);
        assert!(sample.is_forward_head_posture);
    }

    #[test]
    fn test_missing_landmark_drops_frame() {
        let mut c = computer();
        let mut frame = upright_frame(0);
        frame.left_ear = None;
        assert!(c.process(&frame).is_none());
    }

    #[test]
    fn test_low_visibility_drops_frame() {
        let mut c = computer();
        let mut frame = upright_frame(0);
        frame.left_shoulder.as_mut().unwrap().visibility = 0.1;
        assert!(c.process(&frame).is_none());
    }

    #[test]
    fn test_weight_is_elapsed_time() {
        let mut c = computer();
        let first = c.process(&upright_frame(0)).unwrap();
        assert_eq!(first.weight_secs, 0.5); // session start gets nominal weight

        let second = c.process(&upright_frame(2000)).unwrap();
        assert!((second.weight_secs - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_session_break_resets_weight() {
        let mut c = computer();
        c.process(&upright_frame(0)).unwrap();
        // 60 s gap exceeds the 5 s session threshold.
        let resumed = c.process(&upright_frame(60_000)).unwrap();
        assert_eq!(resumed.weight_secs, 0.5);
    }

    #[test]
    fn test_out_of_order_frame_rejected() {
        let mut c = computer();
        c.process(&upright_frame(1000)).unwrap();
        assert!(c.process(&upright_frame(500)).is_none());
    }

    #[test]
    fn test_neutral_angle_shifts_deviation() {
        let mut c = AngleComputer::new(15.0, 45.0, 0.5, 5.0, 0.5);
        let sample = c.process(&leaning_frame(0, 0.2)).unwrap();
        assert!(sample.deviation_degrees.abs() < 1e-9);
        assert!(!sample.is_forward_head_posture);
    }
}
