//! Volume and face fractions of a single cell
//!
//! The level set is sampled at the four cell vertices. Each edge crossing is
//! located by linear interpolation of φ along the edge, and the fluid part of
//! the cell is the polygon obtained by walking the vertices counter-clockwise
//! and keeping fluid vertices plus crossings. Its shoelace area over h² is
//! the volume fraction; the fluid share of each edge is the face fraction.

use crate::core_types::Vec2;
use crate::grid::Side;

use super::level_set::is_solid;

/// Classification of a cell against the solid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellClass {
    /// All vertices fluid
    Fluid,
    /// All vertices solid
    Solid,
    /// Vertices on both sides
    Cut,
}

/// Piece of embedded surface crossing a cut cell
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interface {
    /// Total surface length inside the cell
    pub length: f64,
    /// Unit normal pointing into the fluid
    pub normal: Vec2,
    /// Centroid of the fluid polygon
    pub fluid_centroid: Vec2,
    /// Distance from the fluid centroid to the surface
    pub distance: f64,
}

/// Fractions of one cell
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellFractions {
    /// Fluid volume fraction in [0, 1]
    pub volume: f64,
    /// Fluid fraction of each side, indexed by [`Side::index`]
    pub faces: [f64; 4],
    /// Surface crossing the cell, for cut cells
    pub interface: Option<Interface>,
    /// All four vertices exactly on the surface
    pub degenerate: bool,
}

impl CellFractions {
    /// Fractions of a cell entirely in the fluid
    pub const FLUID: CellFractions = CellFractions {
        volume: 1.0,
        faces: [1.0; 4],
        interface: None,
        degenerate: false,
    };

    /// Classify the cell
    pub fn class(&self) -> CellClass {
        if self.volume >= 1.0 && self.faces.iter().all(|&f| f >= 1.0) {
            CellClass::Fluid
        } else if self.volume <= 0.0 {
            CellClass::Solid
        } else {
            CellClass::Cut
        }
    }

    /// Fraction on one side
    pub fn face(&self, side: Side) -> f64 {
        self.faces[side.index()]
    }
}

/// Fluid fraction of an edge from the level set at its endpoints
///
/// # Arguments
///
/// * `a` - Level set at the first endpoint
/// * `b` - Level set at the second endpoint
///
/// # Returns
///
/// Share of the edge length lying in the fluid, in [0, 1]
#[inline]
pub fn edge_fraction(a: f64, b: f64) -> f64 {
    match (is_solid(a), is_solid(b)) {
        (false, false) => 1.0,
        (true, true) => 0.0,
        (false, true) => (a / (a - b)).clamp(0.0, 1.0),
        (true, false) => (b / (b - a)).clamp(0.0, 1.0),
    }
}

/// Fractions of a square cell from its vertex level-set values
///
/// # Arguments
///
/// * `corner` - Lower-left corner of the cell
/// * `h` - Cell size
/// * `phi` - Level set at the vertices in quadrant order (SW, SE, NW, NE)
///
/// # Returns
///
/// Volume, face fractions and interface data of the cell
pub fn cell_fractions(corner: Vec2, h: f64, phi: [f64; 4]) -> CellFractions {
    let [sw, se, nw, ne] = phi;
    let faces = [
        edge_fraction(sw, nw),
        edge_fraction(se, ne),
        edge_fraction(sw, se),
        edge_fraction(nw, ne),
    ];

    let solid = phi.map(is_solid);
    if solid.iter().all(|&s| !s) {
        return CellFractions::FLUID;
    }
    if solid.iter().all(|&s| s) {
        return CellFractions {
            volume: 0.0,
            faces,
            interface: None,
            degenerate: phi.iter().all(|&v| v == 0.0),
        };
    }

    // Counter-clockwise walk: SW, SE, NE, NW
    let points = [
        corner,
        corner + Vec2::new(h, 0.0),
        corner + Vec2::new(h, h),
        corner + Vec2::new(0.0, h),
    ];
    let values = [sw, se, ne, nw];

    let mut polygon: Vec<Vec2> = Vec::with_capacity(8);
    let mut crossings: Vec<Vec2> = Vec::with_capacity(4);
    for k in 0..4 {
        let next = (k + 1) % 4;
        let (va, vb) = (values[k], values[next]);
        if !is_solid(va) {
            polygon.push(points[k]);
        }
        if is_solid(va) != is_solid(vb) {
            let t = va / (va - vb);
            let x = points[k] + t * (points[next] - points[k]);
            polygon.push(x);
            crossings.push(x);
        }
    }

    let (area, centroid) = polygon_area_centroid(&polygon);
    let volume = (area / (h * h)).clamp(0.0, 1.0);

    let length: f64 = crossings
        .chunks_exact(2)
        .map(|pair| (pair[1] - pair[0]).norm())
        .sum();
    let gradient = Vec2::new(
        ((se + ne) - (sw + nw)) / (2.0 * h),
        ((nw + ne) - (sw + se)) / (2.0 * h),
    );
    let interface = match (gradient.try_normalize(f64::EPSILON), crossings.first()) {
        (Some(normal), Some(&on_surface)) if length > 0.0 && area > 0.0 => Some(Interface {
            length,
            normal,
            fluid_centroid: centroid,
            distance: (centroid - on_surface).dot(&normal).abs(),
        }),
        _ => None,
    };

    CellFractions {
        volume,
        faces,
        interface,
        degenerate: false,
    }
}

/// Area and centroid of a simple polygon (shoelace formula)
fn polygon_area_centroid(polygon: &[Vec2]) -> (f64, Vec2) {
    if polygon.len() < 3 {
        return (0.0, polygon.first().copied().unwrap_or_else(Vec2::zeros));
    }
    let mut twice_area = 0.0;
    let mut weighted = Vec2::zeros();
    for k in 0..polygon.len() {
        let a = polygon[k];
        let b = polygon[(k + 1) % polygon.len()];
        let cross = a.x * b.y - b.x * a.y;
        twice_area += cross;
        weighted += (a + b) * cross;
    }
    if twice_area.abs() <= f64::MIN_POSITIVE {
        let mean = polygon.iter().fold(Vec2::zeros(), |acc, p| acc + p) / polygon.len() as f64;
        return (0.0, mean);
    }
    (0.5 * twice_area.abs(), weighted / (3.0 * twice_area))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_edge_fraction() {
        assert_eq!(edge_fraction(1.0, 2.0), 1.0);
        assert_eq!(edge_fraction(-1.0, 0.0), 0.0);
        assert_relative_eq!(edge_fraction(1.0, -1.0), 0.5);
        assert_relative_eq!(edge_fraction(-3.0, 1.0), 0.25);
        // Vertex exactly on the surface counts as solid
        assert_eq!(edge_fraction(0.0, 0.0), 0.0);
        assert_relative_eq!(edge_fraction(0.0, 2.0), 1.0);
    }

    #[test]
    fn test_fluid_and_solid_cells() {
        let fluid = cell_fractions(Vec2::zeros(), 1.0, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(fluid.volume, 1.0);
        assert_eq!(fluid.class(), CellClass::Fluid);

        let solid = cell_fractions(Vec2::zeros(), 1.0, [-1.0, -2.0, 0.0, -4.0]);
        assert_eq!(solid.volume, 0.0);
        assert_eq!(solid.faces, [0.0; 4]);
        assert_eq!(solid.class(), CellClass::Solid);
        assert!(!solid.degenerate);
    }

    #[test]
    fn test_degenerate_cell() {
        let f = cell_fractions(Vec2::zeros(), 1.0, [0.0; 4]);
        assert!(f.degenerate);
        assert_eq!(f.volume, 0.0);
    }

    #[test]
    fn test_half_cell() {
        // phi = x - 0.5 on the unit cell: solid on the left half
        let f = cell_fractions(Vec2::zeros(), 1.0, [-0.5, 0.5, -0.5, 0.5]);
        assert_relative_eq!(f.volume, 0.5, epsilon = 1e-12);
        assert_eq!(f.face(Side::Left), 0.0);
        assert_eq!(f.face(Side::Right), 1.0);
        assert_relative_eq!(f.face(Side::Bottom), 0.5);
        assert_relative_eq!(f.face(Side::Top), 0.5);

        let interface = f.interface.unwrap();
        assert_relative_eq!(interface.length, 1.0, epsilon = 1e-12);
        assert_relative_eq!(interface.normal.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(interface.fluid_centroid.x, 0.75, epsilon = 1e-12);
        assert_relative_eq!(interface.distance, 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_corner_cut() {
        // phi = x + y - 0.5 on a cell of size 2 at the origin: only SW corner solid
        let f = cell_fractions(Vec2::zeros(), 2.0, [-0.5, 1.5, 1.5, 3.5]);
        // Solid triangle has legs 0.5, area 0.125 out of 4
        assert_relative_eq!(f.volume, 1.0 - 0.125 / 4.0, epsilon = 1e-12);
        assert_relative_eq!(f.face(Side::Bottom), 0.75, epsilon = 1e-12);
        assert_eq!(f.class(), CellClass::Cut);
        assert!(f.interface.is_some());
    }

    #[test]
    fn test_fractions_bounded() {
        let samples = [
            [0.3, -0.7, 0.1, -0.2],
            [-1e-14, 1e-14, 2.0, -3.0],
            [5.0, -5.0, -5.0, 5.0],
            [0.0, 1.0, 0.0, 1.0],
        ];
        for phi in samples {
            let f = cell_fractions(Vec2::new(-1.0, 2.0), 0.5, phi);
            assert!((0.0..=1.0).contains(&f.volume), "{phi:?}");
            assert!(f.faces.iter().all(|x| (0.0..=1.0).contains(x)), "{phi:?}");
        }
    }
}
