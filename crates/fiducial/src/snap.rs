//! Pose inference from marker observations.
//!
//! Produces a target pose that the odometry estimator blends toward.
//! Range comes from the observed marker area against a calibrated anchor
//! (3253 px^2 at 150 mm for a 150 mm marker), with a focal-length fallback
//! when the area is unreliable. The fallback's 0.18 factor and the
//! pair-score weight of 120 are calibration constants; they are used
//! verbatim, not derived.

use nalgebra::Vector2;
use plan::{MarkerRef, Plan};
use types::{normalize_deg, MarkerObservation, Pose};

/// Area anchor for a 150 mm marker observed at 150 mm.
const AREA_ANCHOR_150: f64 = 3253.0;
const ANCHOR_RANGE_MM: f64 = 150.0;
const ANCHOR_SIZE_MM: f64 = 150.0;
/// Fallback pinhole correction factor.
const EDGE_FALLBACK_FACTOR: f64 = 0.18;
/// Plausible range window.
const RANGE_MIN_MM: f64 = 70.0;
const RANGE_MAX_MM: f64 = 2500.0;
/// Foreshortening ratio floor.
const SHAPE_COS_MIN: f64 = 0.08;
/// Pair selection: px of centre separation worth one px^2 of area.
const PAIR_DISTANCE_WEIGHT: f64 = 120.0;
/// Pair range estimate: weight of the baseline estimate vs the area one.
const PAIR_BASELINE_WEIGHT: f64 = 0.85;

/// Snap calibration, from configuration.
#[derive(Debug, Clone)]
pub struct SnapTuning {
    /// Camera focal length in pixels
    pub focal_px: f64,
    /// Full-scale heading correction from image offset
    pub heading_gain_deg: f64,
}

impl Default for SnapTuning {
    fn default() -> Self {
        Self {
            focal_px: 615.0,
            heading_gain_deg: 25.0,
        }
    }
}

/// Why a detection set produced no target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapReject {
    pub reason: String,
}

impl SnapReject {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for SnapReject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Compute a target pose from the observations of one frame.
///
/// With two or more observations referencing plan markers the pair mode
/// wins; otherwise the largest single observation is used. Observations
/// whose id is not in the plan are ignored.
pub fn compute_target(
    plan: &Plan,
    observations: &[MarkerObservation],
    tuning: &SnapTuning,
) -> Result<Pose, SnapReject> {
    let known: Vec<(&MarkerObservation, &MarkerRef)> = observations
        .iter()
        .filter_map(|obs| plan.marker(obs.id).map(|m| (obs, m)))
        .collect();

    if known.is_empty() {
        return Err(SnapReject::new("no observation references a plan marker"));
    }

    if known.len() >= 2 {
        if let Ok(pose) = pair_target(&known, tuning) {
            return Ok(pose);
        }
    }

    // Single-marker mode on the largest observation.
    let (obs, marker) = known
        .iter()
        .max_by(|a, b| a.0.area_px.total_cmp(&b.0.area_px))
        .expect("known is non-empty");
    single_target(obs, marker, tuning)
}

/// Single-marker mode.
fn single_target(
    obs: &MarkerObservation,
    marker: &MarkerRef,
    tuning: &SnapTuning,
) -> Result<Pose, SnapReject> {
    let axis = marker.axis();
    let range = estimate_range(obs, marker, tuning)?;

    let target = if let Some(snap) = marker.snap_pose {
        snap
    } else if let Some(offset) = marker.front_offset_mm {
        marker.position() + axis * offset
    } else {
        marker.position() + axis * range
    };

    // Robot faces the marker.
    let base_deg = (-axis.y).atan2(-axis.x).to_degrees();
    let proximity = (obs.area_px / area_anchor(marker.size_mm)).clamp(0.0, 1.0);

    let image_offset = if obs.frame_width > 0 {
        (obs.center[0] / obs.frame_width as f64 - 0.5)
            * tuning.heading_gain_deg
            * (0.2 * (1.0 - proximity))
    } else {
        0.0
    };
    let shape_yaw = shape_yaw_deg(&obs.corners) * (0.33 * (1.0 - 0.5 * proximity));

    Ok(Pose::new(
        target.x,
        target.y,
        normalize_deg(base_deg + image_offset + shape_yaw),
    ))
}

/// Pair mode: the line between two plan markers fixes the tangent; the
/// pinhole baseline relation fixes the range.
fn pair_target(
    known: &[(&MarkerObservation, &MarkerRef)],
    tuning: &SnapTuning,
) -> Result<Pose, SnapReject> {
    let mut best: Option<(f64, usize, usize)> = None;
    for i in 0..known.len() {
        for j in i + 1..known.len() {
            let (a, b) = (known[i].0, known[j].0);
            let score = a.area_px + b.area_px + PAIR_DISTANCE_WEIGHT * pixel_distance(a, b);
            if best.map_or(true, |(s, _, _)| score > s) {
                best = Some((score, i, j));
            }
        }
    }
    let (_, i, j) = best.expect("at least one pair");
    let (obs_a, ref_a) = known[i];
    let (obs_b, ref_b) = known[j];

    let pixel_sep = pixel_distance(obs_a, obs_b);
    if pixel_sep < 1.0 {
        return Err(SnapReject::new("pair centres coincide in the image"));
    }
    let baseline = ref_b.position() - ref_a.position();
    let world_sep = baseline.norm();
    if world_sep < f64::EPSILON {
        return Err(SnapReject::new("pair markers share a plan position"));
    }

    let mut range = tuning.focal_px * world_sep / pixel_sep;
    // Blend with the area estimates when both are usable.
    let area_ranges: Vec<f64> = [(obs_a, ref_a), (obs_b, ref_b)]
        .iter()
        .filter_map(|(o, m)| area_range(o, m))
        .collect();
    if area_ranges.len() == 2 {
        let area_mean = (area_ranges[0] + area_ranges[1]) / 2.0;
        range = PAIR_BASELINE_WEIGHT * range + (1.0 - PAIR_BASELINE_WEIGHT) * area_mean;
    }
    let range = range.clamp(RANGE_MIN_MM, RANGE_MAX_MM);

    let tangent = baseline / world_sep;
    let mut normal = Vector2::new(-tangent.y, tangent.x);
    let avg_axis = (ref_a.axis() + ref_b.axis()) / 2.0;
    if normal.dot(&avg_axis) < 0.0 {
        normal = -normal;
    }

    let midpoint = (ref_a.position() + ref_b.position()) / 2.0;
    let target = midpoint + normal * range;
    let heading = (-normal.y).atan2(-normal.x).to_degrees();
    Ok(Pose::new(target.x, target.y, normalize_deg(heading)))
}

fn area_anchor(size_mm: f64) -> f64 {
    let ratio = size_mm / ANCHOR_SIZE_MM;
    AREA_ANCHOR_150 * ratio * ratio
}

/// Area-based range, `None` when the observed area is unusable.
fn area_range(obs: &MarkerObservation, marker: &MarkerRef) -> Option<f64> {
    if obs.area_px <= 0.0 {
        return None;
    }
    let anchor_range = ANCHOR_RANGE_MM * (marker.size_mm / ANCHOR_SIZE_MM);
    Some(anchor_range * (area_anchor(marker.size_mm) / obs.area_px).sqrt())
}

/// Range to a marker with foreshortening correction and plausibility
/// clamp.
fn estimate_range(
    obs: &MarkerObservation,
    marker: &MarkerRef,
    tuning: &SnapTuning,
) -> Result<f64, SnapReject> {
    let raw = match area_range(obs, marker) {
        Some(d) => d,
        None => {
            let edge = mean_edge_px(&obs.corners);
            if edge <= 0.0 {
                return Err(SnapReject::new(format!(
                    "marker {} has neither area nor edge extent",
                    obs.id
                )));
            }
            tuning.focal_px * marker.size_mm / edge * EDGE_FALLBACK_FACTOR
        }
    };
    let clamped = raw.clamp(RANGE_MIN_MM, RANGE_MAX_MM);
    Ok(clamped * shape_cos(&obs.corners).sqrt())
}

fn pixel_distance(a: &MarkerObservation, b: &MarkerObservation) -> f64 {
    let dx = a.center[0] - b.center[0];
    let dy = a.center[1] - b.center[1];
    (dx * dx + dy * dy).sqrt()
}

fn edge_len(a: &[f64; 2], b: &[f64; 2]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    (dx * dx + dy * dy).sqrt()
}

fn mean_edge_px(corners: &[[f64; 2]; 4]) -> f64 {
    (edge_len(&corners[0], &corners[1])
        + edge_len(&corners[1], &corners[2])
        + edge_len(&corners[2], &corners[3])
        + edge_len(&corners[3], &corners[0]))
        / 4.0
}

/// Ratio of the quad's average opposite-edge lengths: 1 for a square-on
/// view, smaller as the marker foreshortens.
fn shape_cos(corners: &[[f64; 2]; 4]) -> f64 {
    let width = (edge_len(&corners[0], &corners[1]) + edge_len(&corners[2], &corners[3])) / 2.0;
    let height = (edge_len(&corners[1], &corners[2]) + edge_len(&corners[3], &corners[0])) / 2.0;
    if width <= 0.0 || height <= 0.0 {
        return SHAPE_COS_MIN;
    }
    (width.min(height) / width.max(height)).clamp(SHAPE_COS_MIN, 1.0)
}

/// Signed yaw inferred from the vertical-edge imbalance: positive when the
/// right edge images taller (that side nearer the camera).
fn shape_yaw_deg(corners: &[[f64; 2]; 4]) -> f64 {
    let left = edge_len(&corners[3], &corners[0]);
    let right = edge_len(&corners[1], &corners[2]);
    if left <= 0.0 || right <= 0.0 {
        return 0.0;
    }
    let ratio = (left.min(right) / left.max(right)).clamp(SHAPE_COS_MIN, 1.0);
    let magnitude = ratio.acos().to_degrees();
    if right >= left {
        magnitude
    } else {
        -magnitude
    }
}
