//! Field declarations and typed handles
//!
//! Fields are declared before the run starts. Each declaration carries the
//! boundary conditions on the four domain edges, the condition on embedded
//! solid surfaces, the prolongation/restriction rules used when the mesh
//! changes, and optionally an adaptation tolerance and a diffusion
//! description. The registry hands out copyable handles that index the
//! per-field storage slots.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;
use crate::grid::{Axis, Side};

/// Handle of a cell-centred scalar field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldHandle(pub(crate) u32);

impl FieldHandle {
    /// Storage slot index
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle of a face-centred scalar field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FaceFieldHandle(pub(crate) u32);

impl FaceFieldHandle {
    /// Storage slot index
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handles of the two components of a cell-centred vector field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VectorHandle {
    /// x component
    pub x: FieldHandle,
    /// y component
    pub y: FieldHandle,
}

impl VectorHandle {
    /// Component along an axis
    pub fn component(&self, axis: Axis) -> FieldHandle {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
        }
    }
}

/// Condition applied on one edge of the domain
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BoundaryCondition {
    /// Fixed value on the edge
    Dirichlet(f64),
    /// Fixed outward normal gradient (0 = zero flux)
    Neumann(f64),
    /// Edge wraps to the opposite one
    Periodic,
}

impl BoundaryCondition {
    /// Ghost value mirrored across the edge for an interior value `inner`
    ///
    /// # Arguments
    ///
    /// * `inner` - Value of the cell touching the edge
    /// * `h` - Size of that cell
    ///
    /// # Returns
    ///
    /// Value of the virtual cell on the other side of the edge
    #[inline]
    pub fn ghost(self, inner: f64, h: f64) -> f64 {
        match self {
            BoundaryCondition::Dirichlet(v) => 2.0 * v - inner,
            BoundaryCondition::Neumann(g) => inner + g * h,
            BoundaryCondition::Periodic => inner,
        }
    }
}

/// Conditions on the four domain edges
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundarySpec {
    /// -x edge
    pub left: BoundaryCondition,
    /// +x edge
    pub right: BoundaryCondition,
    /// -y edge
    pub bottom: BoundaryCondition,
    /// +y edge
    pub top: BoundaryCondition,
}

impl Default for BoundarySpec {
    fn default() -> Self {
        Self::zero_flux()
    }
}

impl BoundarySpec {
    /// Same condition on all edges
    pub fn uniform(bc: BoundaryCondition) -> Self {
        Self {
            left: bc,
            right: bc,
            bottom: bc,
            top: bc,
        }
    }

    /// Zero normal gradient on all edges
    pub fn zero_flux() -> Self {
        Self::uniform(BoundaryCondition::Neumann(0.0))
    }

    /// Condition on one edge
    pub fn get(&self, side: Side) -> BoundaryCondition {
        match side {
            Side::Left => self.left,
            Side::Right => self.right,
            Side::Bottom => self.bottom,
            Side::Top => self.top,
        }
    }

    /// Replace the condition on one edge
    pub fn set(&mut self, side: Side, bc: BoundaryCondition) {
        match side {
            Side::Left => self.left = bc,
            Side::Right => self.right = bc,
            Side::Bottom => self.bottom = bc,
            Side::Top => self.top = bc,
        }
    }
}

/// Condition applied on embedded solid surfaces
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum EmbeddedCondition {
    /// Fixed value on the surface
    Dirichlet(f64),
    /// Flux per unit surface length into the fluid
    Neumann(f64),
}

impl Default for EmbeddedCondition {
    fn default() -> Self {
        EmbeddedCondition::Neumann(0.0)
    }
}

/// Parent-level values around a cell, used by prolongation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stencil {
    /// Value of the cell itself
    pub center: f64,
    /// -x neighbour (or boundary ghost)
    pub left: f64,
    /// +x neighbour (or boundary ghost)
    pub right: f64,
    /// -y neighbour (or boundary ghost)
    pub bottom: f64,
    /// +y neighbour (or boundary ghost)
    pub top: f64,
}

impl Stencil {
    /// Stencil of a constant value
    pub fn uniform(v: f64) -> Self {
        Self {
            center: v,
            left: v,
            right: v,
            bottom: v,
            top: v,
        }
    }

    /// Centred differences, per cell width
    #[inline]
    pub fn gradient(&self) -> [f64; 2] {
        [
            0.5 * (self.right - self.left),
            0.5 * (self.top - self.bottom),
        ]
    }

    /// Minmod-limited differences, per cell width
    #[inline]
    pub fn limited_gradient(&self) -> [f64; 2] {
        [
            minmod(self.center - self.left, self.right - self.center),
            minmod(self.center - self.bottom, self.top - self.center),
        ]
    }
}

#[inline]
fn minmod(a: f64, b: f64) -> f64 {
    if a * b <= 0.0 {
        0.0
    } else if a.abs() < b.abs() {
        a
    } else {
        b
    }
}

/// Custom prolongation: children values in quadrant order from a parent stencil
pub type ProlongFn = fn(&Stencil) -> [f64; 4];

/// Custom restriction: parent value from children values in quadrant order
pub type RestrictFn = fn(&[f64; 4]) -> f64;

/// How values are transferred from a parent to new children
#[derive(Debug, Clone, Copy)]
pub enum Prolongation {
    /// Copy the parent value
    Constant,
    /// Centred-gradient linear reconstruction
    Linear,
    /// Linear reconstruction with minmod-limited gradients (no new extrema)
    Limited,
    /// User rule
    Custom(ProlongFn),
}

impl Prolongation {
    /// Children values in quadrant order
    pub fn apply(&self, stencil: &Stencil) -> [f64; 4] {
        let [gx, gy] = match self {
            Prolongation::Constant => return [stencil.center; 4],
            Prolongation::Custom(f) => return f(stencil),
            Prolongation::Linear => stencil.gradient(),
            Prolongation::Limited => stencil.limited_gradient(),
        };
        linear_children(stencil.center, gx, gy)
    }
}

/// Values at the four child centres of a linear profile
///
/// Child centres sit a quarter of the parent width from its centre.
#[inline]
pub fn linear_children(center: f64, gx: f64, gy: f64) -> [f64; 4] {
    let ax = 0.25 * gx;
    let ay = 0.25 * gy;
    [
        center - ax - ay,
        center + ax - ay,
        center - ax + ay,
        center + ax + ay,
    ]
}

/// How child values are combined into the parent value
#[derive(Debug, Clone, Copy)]
pub enum Restriction {
    /// Area average
    Average,
    /// Average weighted by the children's fluid volume fraction
    VolumeWeighted,
    /// Smallest child value
    Min,
    /// Largest child value
    Max,
    /// User rule
    Custom(RestrictFn),
}

impl Restriction {
    /// Parent value from children values and volume fractions
    pub fn apply(&self, values: &[f64; 4], fractions: &[f64; 4]) -> f64 {
        match self {
            Restriction::Average => average4(values),
            Restriction::VolumeWeighted => {
                let weight = (fractions[0] + fractions[1]) + (fractions[2] + fractions[3]);
                if weight > 0.0 {
                    ((fractions[0] * values[0] + fractions[1] * values[1])
                        + (fractions[2] * values[2] + fractions[3] * values[3]))
                        / weight
                } else {
                    average4(values)
                }
            }
            Restriction::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Restriction::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Restriction::Custom(f) => f(values),
        }
    }
}

/// Pairwise area average, exact for four equal values
#[inline]
pub fn average4(v: &[f64; 4]) -> f64 {
    ((v[0] + v[1]) + (v[2] + v[3])) * 0.25
}

/// Where the diffusion coefficient of a field comes from
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Diffusivity {
    /// Same value everywhere
    Constant(f64),
    /// Cell field, harmonically averaged onto faces
    Cell(FieldHandle),
    /// Face field
    Face(FaceFieldHandle),
}

/// Implicit diffusion applied to a field each step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffusionSpec {
    /// Diffusion coefficient
    pub diffusivity: Diffusivity,
    /// Optional volumetric source term
    pub source: Option<FieldHandle>,
}

/// Declaration of a cell-centred scalar field
#[derive(Debug, Clone)]
pub struct FieldSpec {
    /// Unique field name
    pub name: String,
    /// Value given to every cell on registration
    pub default_value: f64,
    /// Conditions on the domain edges
    pub boundary: BoundarySpec,
    /// Condition on embedded solid surfaces
    pub embedded: EmbeddedCondition,
    /// Parent-to-children transfer
    pub prolongation: Prolongation,
    /// Children-to-parent transfer
    pub restriction: Restriction,
    /// Wavelet tolerance if the field drives adaptation
    pub adapt_tolerance: Option<f64>,
    /// Implicit diffusion, if any
    pub diffusion: Option<DiffusionSpec>,
}

impl FieldSpec {
    /// Scalar field with zero default, zero-flux edges and linear prolongation
    pub fn scalar(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_value: 0.0,
            boundary: BoundarySpec::zero_flux(),
            embedded: EmbeddedCondition::default(),
            prolongation: Prolongation::Linear,
            restriction: Restriction::Average,
            adapt_tolerance: None,
            diffusion: None,
        }
    }

    /// Set the initial value
    pub fn with_default(mut self, value: f64) -> Self {
        self.default_value = value;
        self
    }

    /// Set conditions on all edges
    pub fn with_boundary(mut self, boundary: BoundarySpec) -> Self {
        self.boundary = boundary;
        self
    }

    /// Set the condition on one edge
    pub fn with_boundary_on(mut self, side: Side, bc: BoundaryCondition) -> Self {
        self.boundary.set(side, bc);
        self
    }

    /// Set the embedded-surface condition
    pub fn with_embedded(mut self, condition: EmbeddedCondition) -> Self {
        self.embedded = condition;
        self
    }

    /// Set the prolongation rule
    pub fn with_prolongation(mut self, prolongation: Prolongation) -> Self {
        self.prolongation = prolongation;
        self
    }

    /// Set the restriction rule
    pub fn with_restriction(mut self, restriction: Restriction) -> Self {
        self.restriction = restriction;
        self
    }

    /// Drive adaptation with the given wavelet tolerance
    pub fn adapt(mut self, tolerance: f64) -> Self {
        self.adapt_tolerance = Some(tolerance);
        self
    }

    /// Diffuse the field implicitly every step
    pub fn diffusive(mut self, diffusivity: Diffusivity) -> Self {
        let source = self.diffusion.and_then(|d| d.source);
        self.diffusion = Some(DiffusionSpec {
            diffusivity,
            source,
        });
        self
    }

    /// Add a source field to the diffusion of this field
    ///
    /// Has no effect unless [`FieldSpec::diffusive`] is also called.
    pub fn with_source(mut self, source: FieldHandle) -> Self {
        if let Some(diffusion) = self.diffusion.as_mut() {
            diffusion.source = Some(source);
        }
        self
    }
}

/// Kind of a registered cell field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Plain scalar
    Scalar,
    /// One component of a vector field
    Component(Axis),
}

#[derive(Debug, Clone)]
struct FaceFieldSpec {
    name: String,
    default_value: f64,
}

/// Registry of all fields of a domain
#[derive(Debug, Clone)]
pub struct FieldRegistry {
    specs: Vec<FieldSpec>,
    kinds: Vec<FieldKind>,
    face_specs: Vec<FaceFieldSpec>,
    names: FxHashMap<String, FieldHandle>,
    face_names: FxHashMap<String, FaceFieldHandle>,
    periodic: [bool; 2],
    frozen: bool,
}

impl FieldRegistry {
    /// Empty registry for a grid with the given periodicity
    pub fn new(periodic: [bool; 2]) -> Self {
        Self {
            specs: Vec::new(),
            kinds: Vec::new(),
            face_specs: Vec::new(),
            names: FxHashMap::default(),
            face_names: FxHashMap::default(),
            periodic,
            frozen: false,
        }
    }

    /// Declare a cell-centred scalar field
    ///
    /// Edge conditions on periodic axes are replaced by
    /// [`BoundaryCondition::Periodic`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] if the registry is frozen, the
    /// name is empty or taken, a periodic condition is declared on a
    /// non-periodic axis, the tolerance or diffusivity is invalid, or the
    /// diffusion spec refers to unknown fields.
    pub fn register(&mut self, spec: FieldSpec) -> Result<FieldHandle, EngineError> {
        self.register_kind(spec, FieldKind::Scalar)
    }

    /// Declare a vector field as two components named `name.x` and `name.y`
    ///
    /// # Errors
    ///
    /// Same conditions as [`FieldRegistry::register`].
    pub fn register_vector(&mut self, template: FieldSpec) -> Result<VectorHandle, EngineError> {
        let base = template.name.clone();
        let mut x_spec = template.clone();
        x_spec.name = format!("{base}.x");
        let mut y_spec = template;
        y_spec.name = format!("{base}.y");
        self.check_name(&x_spec.name)?;
        self.check_name(&y_spec.name)?;
        let x = self.register_kind(x_spec, FieldKind::Component(Axis::X))?;
        let y = self.register_kind(y_spec, FieldKind::Component(Axis::Y))?;
        Ok(VectorHandle { x, y })
    }

    /// Declare a face-centred scalar field
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] if the registry is frozen or
    /// the name is empty or taken.
    pub fn register_face(
        &mut self,
        name: impl Into<String>,
        default_value: f64,
    ) -> Result<FaceFieldHandle, EngineError> {
        let name = name.into();
        self.check_name(&name)?;
        let handle = FaceFieldHandle(self.face_specs.len() as u32);
        self.face_names.insert(name.clone(), handle);
        debug!("Registered face field '{}'", name);
        self.face_specs.push(FaceFieldSpec {
            name,
            default_value,
        });
        Ok(handle)
    }

    fn register_kind(
        &mut self,
        mut spec: FieldSpec,
        kind: FieldKind,
    ) -> Result<FieldHandle, EngineError> {
        self.check_name(&spec.name)?;
        self.normalize_boundary(&mut spec)?;

        if let Some(tol) = spec.adapt_tolerance {
            if !(tol.is_finite() && tol > 0.0) {
                return Err(EngineError::config(format!(
                    "adaptation tolerance of '{}' must be positive, got {tol}",
                    spec.name
                )));
            }
        }
        if let Some(diffusion) = spec.diffusion {
            self.check_diffusion(&spec.name, diffusion)?;
        }

        let handle = FieldHandle(self.specs.len() as u32);
        self.names.insert(spec.name.clone(), handle);
        debug!("Registered field '{}' ({:?})", spec.name, kind);
        self.specs.push(spec);
        self.kinds.push(kind);
        Ok(handle)
    }

    fn check_name(&self, name: &str) -> Result<(), EngineError> {
        if self.frozen {
            return Err(EngineError::config(format!(
                "cannot register '{name}' after the run has started"
            )));
        }
        if name.is_empty() {
            return Err(EngineError::config("field name must not be empty"));
        }
        if self.names.contains_key(name) || self.face_names.contains_key(name) {
            return Err(EngineError::config(format!(
                "field '{name}' is already registered"
            )));
        }
        Ok(())
    }

    fn normalize_boundary(&self, spec: &mut FieldSpec) -> Result<(), EngineError> {
        let pairs = [(Side::Left, Side::Right), (Side::Bottom, Side::Top)];
        for (axis, (lo, hi)) in pairs.into_iter().enumerate() {
            if self.periodic[axis] {
                spec.boundary.set(lo, BoundaryCondition::Periodic);
                spec.boundary.set(hi, BoundaryCondition::Periodic);
                continue;
            }
            for side in [lo, hi] {
                if spec.boundary.get(side) == BoundaryCondition::Periodic {
                    return Err(EngineError::config(format!(
                        "field '{}' declares a periodic {side:?} edge on a non-periodic axis",
                        spec.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_diffusion(&self, name: &str, diffusion: DiffusionSpec) -> Result<(), EngineError> {
        match diffusion.diffusivity {
            Diffusivity::Constant(d) if !(d.is_finite() && d >= 0.0) => {
                return Err(EngineError::config(format!(
                    "diffusivity of '{name}' must be non-negative, got {d}"
                )));
            }
            Diffusivity::Cell(h) if h.index() >= self.specs.len() => {
                return Err(EngineError::config(format!(
                    "diffusivity of '{name}' refers to an unknown cell field"
                )));
            }
            Diffusivity::Face(h) if h.index() >= self.face_specs.len() => {
                return Err(EngineError::config(format!(
                    "diffusivity of '{name}' refers to an unknown face field"
                )));
            }
            _ => {}
        }
        if let Some(source) = diffusion.source {
            if source.index() >= self.specs.len() {
                return Err(EngineError::config(format!(
                    "source of '{name}' refers to an unknown field"
                )));
            }
        }
        Ok(())
    }

    /// Reject further registrations
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Whether registrations are closed
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Handle of a cell field by name
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] if no such field exists.
    pub fn handle(&self, name: &str) -> Result<FieldHandle, EngineError> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::config(format!("unknown field '{name}'")))
    }

    /// Handle of a face field by name
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] if no such field exists.
    pub fn face_handle(&self, name: &str) -> Result<FaceFieldHandle, EngineError> {
        self.face_names
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::config(format!("unknown face field '{name}'")))
    }

    /// Declaration of a cell field
    ///
    /// # Panics
    ///
    /// Panics if the handle comes from another registry
    pub fn spec(&self, handle: FieldHandle) -> &FieldSpec {
        &self.specs[handle.index()]
    }

    /// Kind of a cell field
    pub fn kind(&self, handle: FieldHandle) -> FieldKind {
        self.kinds[handle.index()]
    }

    /// Name of a cell field
    pub fn name(&self, handle: FieldHandle) -> &str {
        &self.specs[handle.index()].name
    }

    /// Name of a face field
    pub fn face_name(&self, handle: FaceFieldHandle) -> &str {
        &self.face_specs[handle.index()].name
    }

    /// Default value of a face field
    pub fn face_default(&self, handle: FaceFieldHandle) -> f64 {
        self.face_specs[handle.index()].default_value
    }

    /// Number of cell fields
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Whether no cell field is registered
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Number of face fields
    pub fn face_len(&self) -> usize {
        self.face_specs.len()
    }

    /// All cell fields in registration order
    pub fn iter(&self) -> impl Iterator<Item = (FieldHandle, &FieldSpec)> {
        self.specs
            .iter()
            .enumerate()
            .map(|(i, spec)| (FieldHandle(i as u32), spec))
    }

    /// Fields with a diffusion spec, in registration order
    pub fn diffusive(&self) -> Vec<(FieldHandle, DiffusionSpec)> {
        self.iter()
            .filter_map(|(h, spec)| spec.diffusion.map(|d| (h, d)))
            .collect()
    }
}
