use serde::{Serialize, Deserialize};

/// Positions of every particle at one saved step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Step after whose move phase the positions were taken.
    pub step: u32,
    /// Side of the simulation box.
    pub size: f64,
    /// `(x, y)` per particle, ordered by particle id.
    pub positions: Vec<(f64, f64)>,
}

impl Snapshot {
    pub fn particle_count(&self) -> usize {
        self.positions.len()
    }
}
