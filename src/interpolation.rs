//! Interpolation over reference samples.
//!
//! - [`linear_1d`]: piecewise-linear through `(x, y)` samples sorted by `x`,
//!   clamped to the end values outside the sampled range.
//! - [`LinearInterpolator`]: barycentric interpolation on a Delaunay
//!   triangulation (Bowyer–Watson). Undefined outside the convex hull.
//! - [`NearestInterpolator`]: value of the closest sample by Euclidean distance.
//! - [`GridInterpolator`]: linear first, nearest wherever linear is undefined.

/// Piecewise-linear interpolation of `x` through `samples`.
///
/// Samples need not be sorted. Returns `None` only when there are no finite
/// samples or `x` is not finite.
pub fn linear_1d(samples: &[(f64, f64)], x: f64) -> Option<f64> {
    if !x.is_finite() {
        return None;
    }
    let mut points: Vec<(f64, f64)> = samples
        .iter()
        .copied()
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .collect();
    points.sort_by(|a, b| a.0.total_cmp(&b.0));

    let (first, last) = (*points.first()?, *points.last()?);
    if x <= first.0 {
        return Some(first.1);
    }
    if x >= last.0 {
        return Some(last.1);
    }

    // first.0 < x < last.0, so 1 <= idx <= len - 1 and x0 <= x < x1.
    let idx = points.partition_point(|p| p.0 <= x);
    let (x0, y0) = points[idx - 1];
    let (x1, y1) = points[idx];
    Some(y0 + (x - x0) * (y1 - y0) / (x1 - x0))
}

type Point = [f64; 2];

const SUPER_TRIANGLE_SCALE: f64 = 1000.0;
const BARYCENTRIC_TOLERANCE: f64 = 1e-9;

fn orient(a: Point, b: Point, c: Point) -> f64 {
    (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0])
}

fn in_circumcircle(a: Point, b: Point, c: Point, p: Point) -> bool {
    let (ax, ay) = (a[0] - p[0], a[1] - p[1]);
    let (bx, by) = (b[0] - p[0], b[1] - p[1]);
    let (cx, cy) = (c[0] - p[0], c[1] - p[1]);
    let det = (ax * ax + ay * ay) * (bx * cy - cx * by)
        - (bx * bx + by * by) * (ax * cy - cx * ay)
        + (cx * cx + cy * cy) * (ax * by - bx * ay);
    if orient(a, b, c) > 0.0 {
        det > 0.0
    } else {
        det < 0.0
    }
}

/// Delaunay triangulation of a planar point set.
#[derive(Debug, Clone)]
pub struct Triangulation {
    points: Vec<Point>,
    triangles: Vec<[usize; 3]>,
}

impl Triangulation {
    /// Triangulates `points`. Fewer than three points, or all points on one
    /// line, yield no triangles.
    pub fn new(points: &[Point]) -> Self {
        let n = points.len();
        let mut vertices = points.to_vec();
        if n < 3 {
            return Self {
                points: vertices,
                triangles: Vec::new(),
            };
        }

        let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
        let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for p in points {
            min_x = min_x.min(p[0]);
            min_y = min_y.min(p[1]);
            max_x = max_x.max(p[0]);
            max_y = max_y.max(p[1]);
        }
        let span = (max_x - min_x).max(max_y - min_y).max(1.0) * SUPER_TRIANGLE_SCALE;
        let (mid_x, mid_y) = ((min_x + max_x) / 2.0, (min_y + max_y) / 2.0);
        vertices.push([mid_x - 2.0 * span, mid_y - span]);
        vertices.push([mid_x, mid_y + 2.0 * span]);
        vertices.push([mid_x + 2.0 * span, mid_y - span]);

        let mut triangles: Vec<[usize; 3]> = vec![[n, n + 1, n + 2]];
        for i in 0..n {
            let p = vertices[i];
            let (bad, good): (Vec<[usize; 3]>, Vec<[usize; 3]>) = triangles
                .into_iter()
                .partition(|t| in_circumcircle(vertices[t[0]], vertices[t[1]], vertices[t[2]], p));
            triangles = good;

            let mut edges: Vec<(usize, usize)> = Vec::with_capacity(bad.len() * 3);
            for t in &bad {
                for (u, v) in [(t[0], t[1]), (t[1], t[2]), (t[2], t[0])] {
                    edges.push((u.min(v), u.max(v)));
                }
            }
            for &(u, v) in &edges {
                if edges.iter().filter(|&&e| e == (u, v)).count() == 1 {
                    triangles.push([u, v, i]);
                }
            }
        }

        triangles.retain(|t| t.iter().all(|&v| v < n));
        triangles.retain(|t| orient(vertices[t[0]], vertices[t[1]], vertices[t[2]]).abs() > 0.0);
        vertices.truncate(n);
        Self {
            points: vertices,
            triangles,
        }
    }

    pub fn triangles(&self) -> &[[usize; 3]] {
        &self.triangles
    }

    /// Containing triangle and barycentric weights of `q`.
    pub fn locate(&self, q: Point) -> Option<([usize; 3], [f64; 3])> {
        self.triangles.iter().find_map(|&t| {
            let (a, b, c) = (self.points[t[0]], self.points[t[1]], self.points[t[2]]);
            let area = orient(a, b, c);
            let w0 = orient(q, b, c) / area;
            let w1 = orient(a, q, c) / area;
            let w2 = 1.0 - w0 - w1;
            let inside = [w0, w1, w2].iter().all(|&w| w >= -BARYCENTRIC_TOLERANCE);
            inside.then_some((t, [w0, w1, w2]))
        })
    }
}

/// Piecewise-linear interpolation over the convex hull of the samples.
#[derive(Debug, Clone)]
pub struct LinearInterpolator {
    triangulation: Triangulation,
    values: Vec<f64>,
}

impl LinearInterpolator {
    pub fn new(samples: &[(Point, f64)]) -> Self {
        let mut points: Vec<Point> = Vec::with_capacity(samples.len());
        let mut values = Vec::with_capacity(samples.len());
        for &(p, v) in samples {
            // Duplicate sites would make degenerate triangles; the first sample wins.
            if points.contains(&p) {
                continue;
            }
            points.push(p);
            values.push(v);
        }
        Self {
            triangulation: Triangulation::new(&points),
            values,
        }
    }

    pub fn interpolate(&self, q: Point) -> Option<f64> {
        if !(q[0].is_finite() && q[1].is_finite()) {
            return None;
        }
        let (t, w) = self.triangulation.locate(q)?;
        Some(w[0] * self.values[t[0]] + w[1] * self.values[t[1]] + w[2] * self.values[t[2]])
    }
}

/// Nearest-sample lookup.
#[derive(Debug, Clone)]
pub struct NearestInterpolator {
    samples: Vec<(Point, f64)>,
}

impl NearestInterpolator {
    pub fn new(samples: &[(Point, f64)]) -> Self {
        Self {
            samples: samples.to_vec(),
        }
    }

    pub fn interpolate(&self, q: Point) -> Option<f64> {
        if !(q[0].is_finite() && q[1].is_finite()) {
            return None;
        }
        let distance = |p: &Point| (p[0] - q[0]).powi(2) + (p[1] - q[1]).powi(2);
        self.samples
            .iter()
            .fold(None::<(f64, f64)>, |best, (p, v)| {
                let d = distance(p);
                match best {
                    Some((best_d, _)) if best_d <= d => best,
                    _ => Some((d, *v)),
                }
            })
            .map(|(_, v)| v)
    }
}

/// Two-stage estimator: linear inside the hull, nearest outside it.
#[derive(Debug, Clone)]
pub struct GridInterpolator {
    linear: LinearInterpolator,
    nearest: NearestInterpolator,
}

impl GridInterpolator {
    /// Builds both stages from the finite samples only.
    pub fn new(samples: &[(Point, f64)]) -> Self {
        let clean: Vec<(Point, f64)> = samples
            .iter()
            .copied()
            .filter(|(p, v)| p[0].is_finite() && p[1].is_finite() && v.is_finite())
            .collect();
        Self {
            linear: LinearInterpolator::new(&clean),
            nearest: NearestInterpolator::new(&clean),
        }
    }

    pub fn estimate(&self, q: Point) -> Option<f64> {
        self.linear
            .interpolate(q)
            .or_else(|| self.nearest.interpolate(q))
    }

    pub fn estimate_many(&self, queries: &[Point]) -> Vec<Option<f64>> {
        queries.iter().map(|&q| self.estimate(q)).collect()
    }
}
