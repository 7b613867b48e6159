//! Polygon primitives for the collision clamp.
//!
//! Everything works in millimetres on `nalgebra::Vector2<f64>`. Edge lists
//! and bounding boxes are precomputed at construction so a collision check
//! is O(edges) with an early bbox reject.

use nalgebra::Vector2;

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vector2<f64>,
    pub max: Vector2<f64>,
}

impl Aabb {
    pub fn of_points(points: &[Vector2<f64>]) -> Self {
        let mut min = Vector2::new(f64::INFINITY, f64::INFINITY);
        let mut max = Vector2::new(f64::NEG_INFINITY, f64::NEG_INFINITY);
        for p in points {
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
        }
        Self { min, max }
    }

    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
    }

    /// Grow the box by `margin` on every side.
    pub fn inflated(&self, margin: f64) -> Self {
        Self {
            min: self.min - Vector2::new(margin, margin),
            max: self.max + Vector2::new(margin, margin),
        }
    }

    pub fn contains(&self, p: Vector2<f64>) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }
}

/// A directed edge of a polygon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    pub a: Vector2<f64>,
    pub b: Vector2<f64>,
}

impl Edge {
    /// Unit tangent along the edge, or zero for a degenerate edge.
    pub fn tangent(&self) -> Vector2<f64> {
        let d = self.b - self.a;
        let len = d.norm();
        if len > f64::EPSILON {
            d / len
        } else {
            Vector2::zeros()
        }
    }

    /// Distance from `p` to the closest point of the segment.
    pub fn distance_to(&self, p: Vector2<f64>) -> f64 {
        let ab = self.b - self.a;
        let len_sq = ab.norm_squared();
        if len_sq <= f64::EPSILON {
            return (p - self.a).norm();
        }
        let t = ((p - self.a).dot(&ab) / len_sq).clamp(0.0, 1.0);
        (p - (self.a + ab * t)).norm()
    }
}

/// Simple closed polygon with precomputed edges and bounding box.
/// Vertices are stored counter-clockwise (positive signed area).
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    vertices: Vec<Vector2<f64>>,
    edges: Vec<Edge>,
    bbox: Aabb,
}

impl Polygon {
    /// Build a polygon, reversing the winding if the input is clockwise.
    pub fn new(mut vertices: Vec<Vector2<f64>>) -> Self {
        if signed_area(&vertices) < 0.0 {
            vertices.reverse();
        }
        let edges = vertices
            .iter()
            .zip(vertices.iter().cycle().skip(1))
            .map(|(&a, &b)| Edge { a, b })
            .collect();
        let bbox = Aabb::of_points(&vertices);
        Self {
            vertices,
            edges,
            bbox,
        }
    }

    pub fn vertices(&self) -> &[Vector2<f64>] {
        &self.vertices
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn bbox(&self) -> &Aabb {
        &self.bbox
    }

    pub fn area(&self) -> f64 {
        signed_area(&self.vertices)
    }

    /// Even-odd containment test. Points exactly on an edge may land on
    /// either side; callers needing edge tolerance use `distance_to_boundary`.
    pub fn contains(&self, p: Vector2<f64>) -> bool {
        if !self.bbox.contains(p) {
            return false;
        }
        let mut inside = false;
        for edge in &self.edges {
            let (a, b) = (edge.a, edge.b);
            if (a.y > p.y) != (b.y > p.y) {
                let x_cross = a.x + (p.y - a.y) / (b.y - a.y) * (b.x - a.x);
                if p.x < x_cross {
                    inside = !inside;
                }
            }
        }
        inside
    }

    /// Distance from `p` to the nearest boundary point.
    pub fn distance_to_boundary(&self, p: Vector2<f64>) -> f64 {
        self.edges
            .iter()
            .map(|e| e.distance_to(p))
            .fold(f64::INFINITY, f64::min)
    }

    /// The boundary edge nearest to `p` and its distance.
    pub fn nearest_edge(&self, p: Vector2<f64>) -> (Edge, f64) {
        let mut best = (self.edges[0], f64::INFINITY);
        for edge in &self.edges {
            let d = edge.distance_to(p);
            if d < best.1 {
                best = (*edge, d);
            }
        }
        best
    }

    /// Apply a rotation (degrees, CCW) then a translation to every vertex.
    pub fn transformed(&self, translation: Vector2<f64>, theta_deg: f64) -> Polygon {
        let (sin, cos) = theta_deg.to_radians().sin_cos();
        Polygon::new(
            self.vertices
                .iter()
                .map(|v| {
                    Vector2::new(
                        v.x * cos - v.y * sin + translation.x,
                        v.x * sin + v.y * cos + translation.y,
                    )
                })
                .collect(),
        )
    }
}

/// Shoelace signed area; positive for counter-clockwise winding.
pub fn signed_area(vertices: &[Vector2<f64>]) -> f64 {
    if vertices.len() < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..vertices.len() {
        let a = vertices[i];
        let b = vertices[(i + 1) % vertices.len()];
        sum += a.x * b.y - b.x * a.y;
    }
    sum / 2.0
}
