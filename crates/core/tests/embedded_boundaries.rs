//! Volume and face fractions of embedded solids on adaptive meshes

mod common;

use approx::assert_relative_eq;
use canopy_amr_core::geometry::{CellClass, CellFractions};
use canopy_amr_core::grid::FaceSide;
use canopy_amr_core::{
    is_solid, Circle, Domain, Ellipse, EmbeddedGeometry, GridConfig, LevelSet, LevelSetExt,
    Rectangle, Vec2,
};

#[test]
fn test_ellipse_vertex_on_surface_is_solid() {
    // h = 8 / 32 = 0.25, so (1, 0) is a grid vertex
    let mut domain = Domain::new(GridConfig::centered(8.0, 5, 2, 6)).unwrap();
    let ellipse = Ellipse::new(Vec2::zeros(), 1.0, 5.0);
    assert_eq!(ellipse.eval(Vec2::new(1.0, 0.0)), 0.0);
    assert!(is_solid(ellipse.eval(Vec2::new(1.0, 0.0))));
    assert!(!is_solid(ellipse.eval(Vec2::new(1.25, 0.0))));

    let mut geometry = EmbeddedGeometry::new(ellipse);
    let stats = geometry.update(&mut domain, 0.0);
    assert!(stats.cut > 0);

    let cs = domain.cs();
    let tree = domain.tree();
    let inside = tree.locate(Vec2::new(0.875, 0.125)).unwrap();
    let outside = tree.locate(Vec2::new(1.125, 0.125)).unwrap();
    assert_eq!(tree.corner(outside), Vec2::new(1.0, 0.0));

    // The cell to the left of the vertex is almost entirely solid
    let left = domain.value(cs, inside);
    assert!(left > 0.0 && left < 0.01, "cs = {left}");
    // The cell to the right touches the solid only at that vertex
    let right = domain.value(cs, outside);
    assert_relative_eq!(right, 1.0, epsilon = 1e-12);
    // Deep inside the ellipse everything is closed
    let core = tree.locate(Vec2::new(0.1, 0.1)).unwrap();
    assert_eq!(domain.value(cs, core), 0.0);
}

#[test]
fn test_fraction_consistency_on_adaptive_mesh() {
    let mut domain = Domain::new(GridConfig::centered(2.0, 4, 2, 7)).unwrap();
    let shape = Circle {
        center: Vec2::new(0.1, -0.05),
        radius: 0.37,
    }
    .union(Rectangle {
        min: Vec2::new(-0.8, -0.9),
        max: Vec2::new(-0.3, -0.6),
    });
    domain
        .refine_where(|info| shape.eval(info.center).abs() < 2.0 * info.size && info.level() < 6)
        .unwrap();

    let mut geometry = EmbeddedGeometry::new(shape);
    geometry.update(&mut domain, 0.0);

    let tree = domain.tree();
    let cs = domain.cs();
    let fs = domain.fs();
    for face in tree.faces() {
        let f = domain.face_value(fs, face.key);
        assert!((0.0..=1.0).contains(&f));
        let cells: Vec<_> = [face.lo, face.hi].into_iter().filter_map(FaceSide::cell).collect();
        let fractions: Vec<f64> = cells.iter().map(|&c| domain.value(cs, c)).collect();
        if fractions.iter().any(|&v| v == 0.0) {
            assert_eq!(f, 0.0, "face {:?} next to a solid cell is open", face.key);
        }
        let both_fluid = fractions.iter().all(|&v| v == 1.0);
        let touches_cut = cells.iter().any(|&c| domain.interface(c).is_some());
        if both_fluid && !touches_cut {
            assert_eq!(f, 1.0, "face {:?} between fluid cells is closed", face.key);
        }
    }
    for leaf in tree.leaves() {
        let v = domain.value(cs, leaf);
        assert!((0.0..=1.0).contains(&v));
        if let Some(interface) = domain.interface(leaf) {
            assert!(v > 0.0 && v < 1.0);
            assert!(interface.length > 0.0);
            assert_relative_eq!(interface.normal.norm(), 1.0, epsilon = 1e-9);
        }
    }

    // Total fluid area converges to the exact value
    let circle_area = std::f64::consts::PI * 0.37 * 0.37;
    let rect_area = 0.5 * 0.3;
    let fluid = domain.stats(cs).volume;
    assert_relative_eq!(fluid, 4.0 - circle_area - rect_area, epsilon = 2e-3);
}

#[test]
fn test_single_cell_classification() {
    let fluid = canopy_amr_core::geometry::cell_fractions(Vec2::zeros(), 1.0, [1.0, 1.0, 1.0, 1.0]);
    assert_eq!(fluid, CellFractions::FLUID);
    assert_eq!(fluid.class(), CellClass::Fluid);

    let zero = canopy_amr_core::geometry::cell_fractions(Vec2::zeros(), 1.0, [0.0; 4]);
    assert_eq!(zero.class(), CellClass::Solid);
    assert!(zero.degenerate);
}

#[test]
fn test_moving_geometry_recomputes_each_time() {
    let mut domain = Domain::new(GridConfig::centered(2.0, 4, 2, 6)).unwrap();
    let mut geometry = EmbeddedGeometry::moving(canopy_amr_core::TimeVarying(|p: Vec2, t: f64| {
        p.x - (-0.5 + t)
    }));
    geometry.update(&mut domain, 0.0);
    let early = domain.stats(domain.cs()).volume;
    assert!(geometry.needs_update(&domain));
    geometry.update(&mut domain, 0.5);
    let late = domain.stats(domain.cs()).volume;
    // Fluid lies right of the moving line x = t − 0.5
    assert_relative_eq!(early, 2.0 * 1.5, epsilon = 1e-12);
    assert_relative_eq!(late, 2.0 * 1.0, epsilon = 1e-12);
}
