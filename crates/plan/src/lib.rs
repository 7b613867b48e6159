//! Room plan model for roombad.
//!
//! Loads the static room description (contour, placed obstacle shapes,
//! fiducial marker references, start pose) from a JSON document and exposes
//! it with all geometry already transformed to world millimetres. The plan
//! is immutable after load; `Plan::load` is called again to reload.

pub mod geometry;

use geometry::{Aabb, Edge, Polygon};
use nalgebra::Vector2;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use types::Pose;

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Failed to read plan file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse plan document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Room contour needs at least 3 vertices, got {0}")]
    ContourTooSmall(usize),
    #[error("Unknown unit {0:?} (expected mm, cm or m)")]
    UnknownUnit(String),
    #[error("Object references unknown shape {0:?}")]
    UnknownShape(String),
    #[error("Duplicate marker id {0}")]
    DuplicateMarkerId(u32),
    #[error("Object {shape:?} at ({x}, {y}) lies entirely outside the room bounding box")]
    ObjectOutsideRoom { shape: String, x: f64, y: f64 },
}

/// A fiducial marker reference declared in the plan.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerRef {
    pub id: u32,
    pub x_mm: f64,
    pub y_mm: f64,
    pub theta_deg: f64,
    pub size_mm: f64,
    /// Optional explicit snap target; also defines the marker axis.
    pub snap_pose: Option<Vector2<f64>>,
    /// Optional fixed range along the marker axis, used when no snap
    /// pose is declared.
    pub front_offset_mm: Option<f64>,
}

impl MarkerRef {
    pub fn position(&self) -> Vector2<f64> {
        Vector2::new(self.x_mm, self.y_mm)
    }

    /// Unit vector pointing from the marker into the room.
    pub fn axis(&self) -> Vector2<f64> {
        if let Some(snap) = self.snap_pose {
            let d = snap - self.position();
            let len = d.norm();
            if len > f64::EPSILON {
                return d / len;
            }
        }
        let (sin, cos) = self.theta_deg.to_radians().sin_cos();
        Vector2::new(cos, sin)
    }
}

/// An obstacle placed in the room, with its contour already in world
/// coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Obstacle {
    pub shape_id: String,
    pub pose: Pose,
    pub contour: Polygon,
}

/// Nearest violated constraint edge, used by the odometry sliding clamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeHit {
    pub edge: Edge,
    /// How far the disc centre penetrates past the allowed clearance.
    pub depth: f64,
}

/// The loaded room plan.
#[derive(Debug, Clone)]
pub struct Plan {
    room: Polygon,
    obstacles: Vec<Obstacle>,
    start: Pose,
    markers: Vec<MarkerRef>,
}

impl Plan {
    /// Load and validate a plan document.
    /// `default_marker_size_mm` fills marker entries without a size.
    pub fn load(path: &Path, default_marker_size_mm: f64) -> Result<Self, PlanError> {
        let text = std::fs::read_to_string(path)?;
        let plan = Self::from_json_str(&text, default_marker_size_mm)?;
        info!(
            path = %path.display(),
            obstacles = plan.obstacles.len(),
            markers = plan.markers.len(),
            "Loaded plan"
        );
        Ok(plan)
    }

    pub fn from_json_str(text: &str, default_marker_size_mm: f64) -> Result<Self, PlanError> {
        let doc: PlanDoc = serde_json::from_str(text)?;
        Self::from_doc(doc, default_marker_size_mm)
    }

    /// Load a replacement plan. On failure the previous plan remains
    /// active: the error is logged and `current` is returned unchanged.
    pub fn reload(
        current: &Arc<Plan>,
        path: &Path,
        default_marker_size_mm: f64,
    ) -> Arc<Plan> {
        match Plan::load(path, default_marker_size_mm) {
            Ok(fresh) => Arc::new(fresh),
            Err(e) => {
                warn!(%e, path = %path.display(), "Plan reload failed, keeping active plan");
                current.clone()
            }
        }
    }

    fn from_doc(doc: PlanDoc, default_marker_size_mm: f64) -> Result<Self, PlanError> {
        let scale = match doc.unit.as_str() {
            "mm" => 1.0,
            "cm" => 10.0,
            "m" => 1000.0,
            other => return Err(PlanError::UnknownUnit(other.to_string())),
        };

        if doc.contour.len() < 3 {
            return Err(PlanError::ContourTooSmall(doc.contour.len()));
        }
        let room = Polygon::new(
            doc.contour
                .iter()
                .map(|&[x, y]| Vector2::new(x * scale, y * scale))
                .collect(),
        );

        let shapes: HashMap<String, Vec<Vector2<f64>>> = doc
            .object_shapes
            .into_iter()
            .map(|(id, pts)| {
                (
                    id,
                    pts.iter()
                        .map(|&[x, y]| Vector2::new(x * scale, y * scale))
                        .collect(),
                )
            })
            .collect();

        let mut obstacles = Vec::with_capacity(doc.objects.len());
        for obj in doc.objects {
            let local = shapes
                .get(&obj.shape)
                .ok_or_else(|| PlanError::UnknownShape(obj.shape.clone()))?;
            let pose = Pose::new(obj.x * scale, obj.y * scale, obj.theta);
            let contour = Polygon::new(local.clone())
                .transformed(Vector2::new(pose.x_mm, pose.y_mm), pose.theta_deg);
            if !contour.bbox().intersects(room.bbox()) {
                return Err(PlanError::ObjectOutsideRoom {
                    shape: obj.shape,
                    x: pose.x_mm,
                    y: pose.y_mm,
                });
            }
            obstacles.push(Obstacle {
                shape_id: obj.shape,
                pose,
                contour,
            });
        }

        let mut markers = Vec::with_capacity(doc.aruco_markers.len());
        for m in doc.aruco_markers {
            if markers.iter().any(|r: &MarkerRef| r.id == m.id) {
                return Err(PlanError::DuplicateMarkerId(m.id));
            }
            markers.push(MarkerRef {
                id: m.id,
                x_mm: m.x * scale,
                y_mm: m.y * scale,
                theta_deg: m.theta,
                size_mm: m.size_mm.unwrap_or(default_marker_size_mm),
                snap_pose: m.snap_pose.map(|[x, y]| Vector2::new(x * scale, y * scale)),
                front_offset_mm: m.front_offset_mm.map(|v| v * scale),
            });
        }

        Ok(Self {
            room,
            obstacles,
            start: Pose::new(
                doc.start_pose.x * scale,
                doc.start_pose.y * scale,
                doc.start_pose.theta,
            ),
            markers,
        })
    }

    pub fn room_contour(&self) -> &Polygon {
        &self.room
    }

    pub fn obstacles(&self) -> &[Obstacle] {
        &self.obstacles
    }

    pub fn start_pose(&self) -> Pose {
        self.start
    }

    pub fn markers(&self) -> &[MarkerRef] {
        &self.markers
    }

    pub fn marker(&self, id: u32) -> Option<&MarkerRef> {
        self.markers.iter().find(|m| m.id == id)
    }

    /// True when a disc centred at `center` keeps `clearance` millimetres
    /// from the room boundary and from every obstacle.
    pub fn disc_fits(&self, center: Vector2<f64>, clearance: f64) -> bool {
        self.worst_violation(center, clearance).is_none()
    }

    /// The most-penetrated constraint edge for a disc at `center`, or
    /// `None` when the disc fits.
    pub fn worst_violation(&self, center: Vector2<f64>, clearance: f64) -> Option<EdgeHit> {
        let mut worst: Option<EdgeHit> = None;
        let mut consider = |edge: Edge, depth: f64| {
            if depth > 0.0 && worst.map_or(true, |w| depth > w.depth) {
                worst = Some(EdgeHit { edge, depth });
            }
        };

        // Room: the disc must stay inside with `clearance` to every wall.
        let (edge, dist) = self.room.nearest_edge(center);
        if self.room.contains(center) {
            consider(edge, clearance - dist);
        } else {
            consider(edge, clearance + dist);
        }

        // Obstacles: the disc must stay outside with the same clearance.
        for obstacle in &self.obstacles {
            if !obstacle.contour.bbox().inflated(clearance).contains(center) {
                continue;
            }
            let (edge, dist) = obstacle.contour.nearest_edge(center);
            if obstacle.contour.contains(center) {
                consider(edge, clearance + dist);
            } else {
                consider(edge, clearance - dist);
            }
        }

        worst
    }

    /// Bounding box of the room contour.
    pub fn room_bbox(&self) -> &Aabb {
        self.room.bbox()
    }
}

// Raw document shape. Field names follow the on-disk plan format.
#[derive(Debug, Deserialize)]
struct PlanDoc {
    #[serde(default = "default_unit")]
    unit: String,
    contour: Vec<[f64; 2]>,
    start_pose: StartPoseDoc,
    #[serde(default)]
    object_shapes: HashMap<String, Vec<[f64; 2]>>,
    #[serde(default)]
    objects: Vec<ObjectDoc>,
    #[serde(default)]
    aruco_markers: Vec<MarkerDoc>,
}

fn default_unit() -> String {
    "mm".to_string()
}

#[derive(Debug, Deserialize)]
struct StartPoseDoc {
    x: f64,
    y: f64,
    #[serde(default)]
    theta: f64,
}

#[derive(Debug, Deserialize)]
struct ObjectDoc {
    shape: String,
    x: f64,
    y: f64,
    #[serde(default)]
    theta: f64,
}

#[derive(Debug, Deserialize)]
struct MarkerDoc {
    id: u32,
    x: f64,
    y: f64,
    #[serde(default)]
    theta: f64,
    #[serde(default)]
    size_mm: Option<f64>,
    #[serde(default)]
    snap_pose: Option<[f64; 2]>,
    #[serde(default)]
    front_offset_mm: Option<f64>,
}
