use crate::grid::{for_each_neighbor_cell, unlink, CellMembers, GridError};
use crate::particle::Particle;
use parking_lot::Mutex;
use particle_common::SimParams;

/// Full grid shared by every worker thread. Each cell guards its membership list with
/// its own lock; a lock is never held across more than one cell.
#[derive(Debug)]
pub struct LockedGrid {
    params: SimParams,
    cells: Vec<Mutex<CellMembers>>,
}

impl LockedGrid {
    pub fn new(params: &SimParams) -> Self {
        let dim = params.grid_dim;
        LockedGrid {
            params: params.clone(),
            cells: (0..dim * dim).map(|_| Mutex::new(CellMembers::new())).collect(),
        }
    }

    pub fn with_particles(params: &SimParams, particles: &[Particle]) -> Self {
        let grid = Self::new(params);
        for (idx, particle) in particles.iter().enumerate() {
            grid.insert(idx, particle);
        }
        grid
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    #[inline(always)]
    pub fn coordinates(&self, particle: &Particle) -> (usize, usize) {
        (
            self.params.grid_coordinate(particle.x),
            self.params.grid_coordinate(particle.y),
        )
    }

    #[inline(always)]
    pub fn cell_index(&self, particle: &Particle) -> usize {
        let (row, col) = self.coordinates(particle);
        row * self.params.grid_dim + col
    }

    pub fn insert(&self, idx: usize, particle: &Particle) {
        let cell = self.cell_index(particle);
        self.cells[cell].lock().push(idx);
    }

    pub fn remove(&self, idx: usize, cell: usize) -> Result<(), GridError> {
        let cells = self.cells.len();
        let lock = self
            .cells
            .get(cell)
            .ok_or(GridError::CellOutOfRange { cell, cells })?;
        let mut members = lock.lock();
        unlink(&mut members, idx, cell)
    }

    /// Remove-then-insert when the cell changed. The two cells are locked one after
    /// the other, never together.
    pub fn reclassify(&self, idx: usize, particle: &Particle, old_cell: usize) -> Result<usize, GridError> {
        let new_cell = self.cell_index(particle);
        if new_cell != old_cell {
            self.remove(idx, old_cell)?;
            self.cells[new_cell].lock().push(idx);
        }
        Ok(new_cell)
    }

    /// Visits the 3x3 block around `particle`, holding each cell's lock only while
    /// that cell's members are passed to `f`.
    #[inline(always)]
    pub fn for_each_neighbor<F>(&self, particle: &Particle, mut f: F)
    where
        F: FnMut(usize),
    {
        let (row, col) = self.coordinates(particle);
        let dim = self.params.grid_dim;
        for_each_neighbor_cell(row, col, dim, dim, |cell| {
            let members = self.cells[cell].lock();
            for &member in members.iter() {
                f(member);
            }
        });
    }

    /// Copies every membership list. Only meaningful while no worker is mutating.
    pub fn membership(&self) -> Vec<Vec<usize>> {
        self.cells.iter().map(|cell| cell.lock().to_vec()).collect()
    }

    pub fn member_count(&self) -> usize {
        self.cells.iter().map(|cell| cell.lock().len()).sum()
    }
}
