//! Field value storage
//!
//! Cell fields are stored as one flat `Vec<f64>` per field, indexed by
//! [`CellId`]. Every live cell (leaf or refined) has a value in every slot;
//! destroyed slots keep stale values until reused. Face fields are sparse
//! maps from [`FaceKey`] to value with a per-field default.

use rustc_hash::FxHashMap;

use super::registry::{FaceFieldHandle, FieldHandle};
use crate::grid::{CellId, FaceKey};

/// Storage for all cell-centred fields
#[derive(Debug, Clone, Default)]
pub struct FieldData {
    slots: Vec<Vec<f64>>,
    defaults: Vec<f64>,
    capacity: usize,
}

impl FieldData {
    /// Create empty storage sized for `capacity` cells
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of cell slots in the tree
    ///
    /// # Returns
    ///
    /// Storage with no field slots
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            defaults: Vec::new(),
            capacity,
        }
    }

    /// Append a slot filled with `value`
    ///
    /// Slots are appended in handle order, so the new slot's index equals
    /// the handle of the field just registered.
    pub fn add_slot(&mut self, value: f64) {
        self.slots.push(vec![value; self.capacity]);
        self.defaults.push(value);
    }

    /// Number of field slots
    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Number of cell values per slot
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Grow every slot to hold `capacity` cells
    ///
    /// New entries take the slot's default value.
    pub fn ensure_capacity(&mut self, capacity: usize) {
        if capacity <= self.capacity {
            return;
        }
        for (slot, &default) in self.slots.iter_mut().zip(&self.defaults) {
            slot.resize(capacity, default);
        }
        self.capacity = capacity;
    }

    /// Get the value of a field in a cell
    ///
    /// # Panics
    ///
    /// Panics if the handle or cell is out of range
    #[inline]
    pub fn get(&self, field: FieldHandle, cell: CellId) -> f64 {
        self.slots[field.index()][cell.index()]
    }

    /// Set the value of a field in a cell
    ///
    /// # Panics
    ///
    /// Panics if the handle or cell is out of range
    #[inline]
    pub fn set(&mut self, field: FieldHandle, cell: CellId, value: f64) {
        self.slots[field.index()][cell.index()] = value;
    }

    /// All values of one field, indexed by cell id
    #[inline]
    pub fn slot(&self, field: FieldHandle) -> &[f64] {
        &self.slots[field.index()]
    }

    /// Mutable values of one field, indexed by cell id
    #[inline]
    pub fn slot_mut(&mut self, field: FieldHandle) -> &mut [f64] {
        &mut self.slots[field.index()]
    }

    /// Fill one field with a value in every cell
    pub fn fill(&mut self, field: FieldHandle, value: f64) {
        self.slots[field.index()].fill(value);
    }
}

/// Storage for all face-centred fields
#[derive(Debug, Clone, Default)]
pub struct FaceData {
    stores: Vec<FxHashMap<FaceKey, f64>>,
    defaults: Vec<f64>,
}

impl FaceData {
    /// Append a store whose missing faces read as `default`
    pub fn add_store(&mut self, default: f64) {
        self.stores.push(FxHashMap::default());
        self.defaults.push(default);
    }

    /// Value on a face, or the field default if never set
    #[inline]
    pub fn get(&self, field: FaceFieldHandle, face: FaceKey) -> f64 {
        self.stores[field.index()]
            .get(&face)
            .copied()
            .unwrap_or(self.defaults[field.index()])
    }

    /// Set the value on a face
    pub fn set(&mut self, field: FaceFieldHandle, face: FaceKey, value: f64) {
        self.stores[field.index()].insert(face, value);
    }

    /// Replace every stored value of a field
    pub fn replace(&mut self, field: FaceFieldHandle, values: FxHashMap<FaceKey, f64>) {
        self.stores[field.index()] = values;
    }

    /// Forget every stored value of a field
    pub fn clear(&mut self, field: FaceFieldHandle) {
        self.stores[field.index()].clear();
    }

    /// Number of faces with an explicit value
    pub fn stored(&self, field: FaceFieldHandle) -> usize {
        self.stores[field.index()].len()
    }
}
