use serde::{Deserialize, Serialize};

/// Simulation parameters derived from the configuration, used frequently during simulation steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimParams {
    pub particle_count: usize,

    // World & Grid
    /// Side of the square box `[0, size] x [0, size]`.
    pub size: f64,
    /// Interaction cutoff; also the side of a grid cell.
    pub cutoff: f64,
    pub cutoff_sq: f64,
    pub inv_cutoff: f64,
    /// Cells per side of the full grid.
    pub grid_dim: usize,

    // Force & Integration
    pub min_r_sq: f64,
    pub mass: f64,
    pub dt: f64,
}

impl SimParams {
    /// Grid row or column of a coordinate, clamped to the grid.
    #[inline(always)]
    pub fn grid_coordinate(&self, coordinate: f64) -> usize {
        let raw = (coordinate * self.inv_cutoff).floor();
        // Negative and NaN both land in the first cell
        if !(raw > 0.0) {
            0
        } else {
            (raw as usize).min(self.grid_dim - 1)
        }
    }

    /// Largest per-step displacement that cannot skip a band of `band_rows` rows.
    pub fn max_band_displacement(&self, band_rows: usize) -> f64 {
        band_rows as f64 * self.cutoff
    }
}
