//! Level-set descriptions of embedded solids
//!
//! A solid is described implicitly by a scalar function φ of position:
//! - φ > 0: fluid
//! - φ ≤ 0: solid (a vertex exactly on the contour counts as solid)
//! - φ = 0: the solid surface
//!
//! Shapes follow the "negative inside" convention so that composition with
//! `min`/`max` behaves like set union/intersection of solids.

use std::sync::Arc;

use crate::core_types::Vec2;

/// Whether a level-set value marks the solid side
///
/// Zero is solid, so a vertex exactly on the contour never counts as fluid.
#[inline]
pub fn is_solid(phi: f64) -> bool {
    phi <= 0.0
}

/// Implicit description of embedded solids
pub trait LevelSet: Send + Sync {
    /// Level-set value at a point
    fn eval(&self, p: Vec2) -> f64;

    /// Level-set value at a point and time
    ///
    /// Static shapes ignore the time.
    fn eval_at(&self, p: Vec2, _time: f64) -> f64 {
        self.eval(p)
    }
}

impl<F> LevelSet for F
where
    F: Fn(Vec2) -> f64 + Send + Sync,
{
    fn eval(&self, p: Vec2) -> f64 {
        self(p)
    }
}

/// Composition helpers available on every level set
pub trait LevelSetExt: LevelSet + Sized {
    /// Solid where either shape is solid
    fn union<B: LevelSet>(self, other: B) -> Union<Self, B> {
        Union(self, other)
    }

    /// Solid where both shapes are solid
    fn intersection<B: LevelSet>(self, other: B) -> Intersection<Self, B> {
        Intersection(self, other)
    }

    /// Solid where `self` is solid and `other` is not
    fn difference<B: LevelSet>(self, other: B) -> Difference<Self, B> {
        Difference(self, other)
    }

    /// Swap solid and fluid
    fn complement(self) -> Complement<Self> {
        Complement(self)
    }

    /// Shift the shape by an offset
    fn translate(self, offset: Vec2) -> Translate<Self> {
        Translate {
            inner: self,
            offset,
        }
    }

    /// Share the shape behind a reference-counted trait object
    fn shared(self) -> Arc<dyn LevelSet>
    where
        Self: 'static,
    {
        Arc::new(self)
    }
}

impl<T: LevelSet + Sized> LevelSetExt for T {}

/// Disc of solid material
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Circle {
    /// Centre
    pub center: Vec2,
    /// Radius
    pub radius: f64,
}

impl LevelSet for Circle {
    fn eval(&self, p: Vec2) -> f64 {
        (p - self.center).norm() - self.radius
    }
}

/// Solid ellipse, optionally rotated
///
/// φ = (x'/a)² + (y'/b)² − 1 in the ellipse frame, which is negative inside
/// and matches the leaf outlines used by the canopy cases.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ellipse {
    /// Centre
    pub center: Vec2,
    /// Semi-axis along the (rotated) x direction
    pub semi_x: f64,
    /// Semi-axis along the (rotated) y direction
    pub semi_y: f64,
    /// Counter-clockwise rotation in radians
    pub angle: f64,
}

impl Ellipse {
    /// Axis-aligned ellipse
    pub fn new(center: Vec2, semi_x: f64, semi_y: f64) -> Self {
        Self {
            center,
            semi_x,
            semi_y,
            angle: 0.0,
        }
    }

    /// Rotate counter-clockwise by `angle` radians
    pub fn rotated(mut self, angle: f64) -> Self {
        self.angle = angle;
        self
    }
}

impl LevelSet for Ellipse {
    fn eval(&self, p: Vec2) -> f64 {
        let d = p - self.center;
        let (sin, cos) = self.angle.sin_cos();
        let x = cos * d.x + sin * d.y;
        let y = -sin * d.x + cos * d.y;
        (x / self.semi_x).powi(2) + (y / self.semi_y).powi(2) - 1.0
    }
}

/// Solid axis-aligned box (canopy cubes, buildings)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rectangle {
    /// Lower-left corner
    pub min: Vec2,
    /// Upper-right corner
    pub max: Vec2,
}

impl LevelSet for Rectangle {
    fn eval(&self, p: Vec2) -> f64 {
        let center = 0.5 * (self.min + self.max);
        let half = 0.5 * (self.max - self.min);
        let q = (p - center).abs() - half;
        let outside = Vec2::new(q.x.max(0.0), q.y.max(0.0)).norm();
        let inside = q.x.max(q.y).min(0.0);
        outside + inside
    }
}

/// Solid half-plane
///
/// The normal points from the solid into the fluid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HalfPlane {
    /// Point on the surface
    pub point: Vec2,
    /// Unit normal pointing into the fluid
    pub normal: Vec2,
}

impl LevelSet for HalfPlane {
    fn eval(&self, p: Vec2) -> f64 {
        (p - self.point).dot(&self.normal)
    }
}

/// Cosine-shaped surface `y = base + amplitude·cos(wavenumber·x)`
///
/// Models wavy roofs; the solid lies above the surface when `solid_above`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CosineWave {
    /// Mean height
    pub base: f64,
    /// Wave amplitude
    pub amplitude: f64,
    /// Angular wavenumber
    pub wavenumber: f64,
    /// Which side is solid
    pub solid_above: bool,
}

impl LevelSet for CosineWave {
    fn eval(&self, p: Vec2) -> f64 {
        let surface = self.base + self.amplitude * (self.wavenumber * p.x).cos();
        if self.solid_above {
            surface - p.y
        } else {
            p.y - surface
        }
    }
}

/// Union of two solids
#[derive(Debug, Clone, Copy)]
pub struct Union<A, B>(pub A, pub B);

impl<A: LevelSet, B: LevelSet> LevelSet for Union<A, B> {
    fn eval(&self, p: Vec2) -> f64 {
        self.0.eval(p).min(self.1.eval(p))
    }

    fn eval_at(&self, p: Vec2, time: f64) -> f64 {
        self.0.eval_at(p, time).min(self.1.eval_at(p, time))
    }
}

/// Intersection of two solids
#[derive(Debug, Clone, Copy)]
pub struct Intersection<A, B>(pub A, pub B);

impl<A: LevelSet, B: LevelSet> LevelSet for Intersection<A, B> {
    fn eval(&self, p: Vec2) -> f64 {
        self.0.eval(p).max(self.1.eval(p))
    }

    fn eval_at(&self, p: Vec2, time: f64) -> f64 {
        self.0.eval_at(p, time).max(self.1.eval_at(p, time))
    }
}

/// First solid with the second carved out
#[derive(Debug, Clone, Copy)]
pub struct Difference<A, B>(pub A, pub B);

impl<A: LevelSet, B: LevelSet> LevelSet for Difference<A, B> {
    fn eval(&self, p: Vec2) -> f64 {
        self.0.eval(p).max(-self.1.eval(p))
    }

    fn eval_at(&self, p: Vec2, time: f64) -> f64 {
        self.0.eval_at(p, time).max(-self.1.eval_at(p, time))
    }
}

/// Solid and fluid swapped
#[derive(Debug, Clone, Copy)]
pub struct Complement<A>(pub A);

impl<A: LevelSet> LevelSet for Complement<A> {
    fn eval(&self, p: Vec2) -> f64 {
        -self.0.eval(p)
    }

    fn eval_at(&self, p: Vec2, time: f64) -> f64 {
        -self.0.eval_at(p, time)
    }
}

/// Shape shifted by a fixed offset
#[derive(Debug, Clone, Copy)]
pub struct Translate<A> {
    inner: A,
    offset: Vec2,
}

impl<A: LevelSet> LevelSet for Translate<A> {
    fn eval(&self, p: Vec2) -> f64 {
        self.inner.eval(p - self.offset)
    }

    fn eval_at(&self, p: Vec2, time: f64) -> f64 {
        self.inner.eval_at(p - self.offset, time)
    }
}

/// Level set that changes with time, for moving geometry
///
/// `eval` samples the shape at time zero.
#[derive(Debug, Clone, Copy)]
pub struct TimeVarying<F>(pub F);

impl<F> LevelSet for TimeVarying<F>
where
    F: Fn(Vec2, f64) -> f64 + Send + Sync,
{
    fn eval(&self, p: Vec2) -> f64 {
        (self.0)(p, 0.0)
    }

    fn eval_at(&self, p: Vec2, time: f64) -> f64 {
        (self.0)(p, time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_circle_sign() {
        let c = Circle {
            center: Vec2::new(1.0, 1.0),
            radius: 0.5,
        };
        assert!(is_solid(c.eval(Vec2::new(1.0, 1.2))));
        assert!(!is_solid(c.eval(Vec2::new(2.0, 1.0))));
        assert_relative_eq!(c.eval(Vec2::new(1.5, 1.0)), 0.0);
        assert!(is_solid(c.eval(Vec2::new(1.5, 1.0))));
    }

    #[test]
    fn test_ellipse_vertex_is_on_surface() {
        let leaf = Ellipse::new(Vec2::zeros(), 1.0, 5.0);
        assert_eq!(leaf.eval(Vec2::new(1.0, 0.0)), 0.0);
        assert!(leaf.eval(Vec2::new(1.25, 0.0)) > 0.0);
        assert!(leaf.eval(Vec2::new(0.0, 4.9)) < 0.0);
    }

    #[test]
    fn test_rotated_ellipse() {
        let leaf = Ellipse::new(Vec2::zeros(), 1.0, 5.0).rotated(std::f64::consts::FRAC_PI_2);
        // Long axis now along x
        assert!(leaf.eval(Vec2::new(4.0, 0.0)) < 0.0);
        assert!(leaf.eval(Vec2::new(0.0, 2.0)) > 0.0);
    }

    #[test]
    fn test_rectangle_distance() {
        let cube = Rectangle {
            min: Vec2::new(0.0, 0.0),
            max: Vec2::new(2.0, 1.0),
        };
        assert_relative_eq!(cube.eval(Vec2::new(3.0, 0.5)), 1.0);
        assert_relative_eq!(cube.eval(Vec2::new(1.0, 0.5)), -0.5);
        assert_relative_eq!(cube.eval(Vec2::new(3.0, 2.0)), 2f64.sqrt());
    }

    #[test]
    fn test_composition() {
        let a = Circle {
            center: Vec2::new(-1.0, 0.0),
            radius: 0.5,
        };
        let b = Circle {
            center: Vec2::new(1.0, 0.0),
            radius: 0.5,
        };
        let both = a.union(b);
        assert!(is_solid(both.eval(Vec2::new(-1.0, 0.0))));
        assert!(is_solid(both.eval(Vec2::new(1.0, 0.0))));
        assert!(!is_solid(both.eval(Vec2::zeros())));

        let none = a.intersection(b);
        assert!(!is_solid(none.eval(Vec2::new(1.0, 0.0))));

        let ring = Circle {
            center: Vec2::zeros(),
            radius: 1.0,
        }
        .difference(Circle {
            center: Vec2::zeros(),
            radius: 0.5,
        });
        assert!(!is_solid(ring.eval(Vec2::zeros())));
        assert!(is_solid(ring.eval(Vec2::new(0.75, 0.0))));

        let hole = a.complement();
        assert!(!is_solid(hole.eval(Vec2::new(-1.0, 0.0))));

        let moved = a.translate(Vec2::new(2.0, 0.0));
        assert!(is_solid(moved.eval(Vec2::new(1.0, 0.0))));
    }

    #[test]
    fn test_roof_and_closure() {
        let roof = CosineWave {
            base: 85.0,
            amplitude: 15.0,
            wavenumber: 0.1,
            solid_above: true,
        };
        assert!(is_solid(roof.eval(Vec2::new(0.0, 150.0))));
        assert!(!is_solid(roof.eval(Vec2::new(0.0, 50.0))));

        let ground = |p: Vec2| p.y - 0.25;
        assert!(is_solid(ground.eval(Vec2::new(0.0, 0.0))));
        let shared = ground.shared();
        assert!(!is_solid(shared.eval(Vec2::new(0.0, 1.0))));
    }

    #[test]
    fn test_time_varying() {
        let moving = TimeVarying(|p: Vec2, t: f64| (p - Vec2::new(t, 0.0)).norm() - 0.5);
        assert!(is_solid(moving.eval(Vec2::zeros())));
        assert!(!is_solid(moving.eval_at(Vec2::zeros(), 2.0)));
        assert!(is_solid(moving.eval_at(Vec2::new(2.0, 0.0), 2.0)));
    }
}
