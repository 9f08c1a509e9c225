use crate::particle::Particle;
use particle_common::SimParams;
use smallvec::SmallVec;
use std::fmt;
use std::ops::RangeInclusive;

/// Indices of the particles whose current position maps into one cell.
/// Cells never own particle records, they refer to slots of the particle array.
pub type CellMembers = SmallVec<[usize; 8]>;

/// Grid consistency violations. Any of these means the membership lists no longer
/// match the particle positions and the run cannot continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GridError {
    /// `remove` was told the particle lives in a cell whose list does not contain it.
    NotInCell { particle: usize, cell: usize },
    /// A cell index outside the grid was supplied.
    CellOutOfRange { cell: usize, cells: usize },
    /// A particle expected to be tracked maps outside this worker's band.
    Untracked { particle: usize },
}

impl fmt::Display for GridError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GridError::NotInCell { particle, cell } => {
                write!(f, "particle {} is not a member of cell {}", particle, cell)
            }
            GridError::CellOutOfRange { cell, cells } => {
                write!(f, "cell index {} out of range for a grid of {} cells", cell, cells)
            }
            GridError::Untracked { particle } => {
                write!(f, "particle {} is not tracked by this grid", particle)
            }
        }
    }
}

impl std::error::Error for GridError {}

/// Scan-and-unlink. Membership order is irrelevant so the hole is filled from the back.
pub(crate) fn unlink(members: &mut CellMembers, particle: usize, cell: usize) -> Result<(), GridError> {
    match members.iter().position(|&member| member == particle) {
        Some(pos) => {
            members.swap_remove(pos);
            Ok(())
        }
        None => Err(GridError::NotInCell { particle, cell }),
    }
}

/// The 3x3 neighbourhood of `center` clamped to `[0, len)`.
#[inline(always)]
pub(crate) fn clamped_span(center: usize, len: usize) -> RangeInclusive<usize> {
    center.saturating_sub(1)..=(center + 1).min(len - 1)
}

/// Calls `f` with the index of every cell in the 3x3 block around (`row`, `col`),
/// clamped to a `rows x cols` row-major grid.
#[inline(always)]
pub fn for_each_neighbor_cell<F>(row: usize, col: usize, rows: usize, cols: usize, mut f: F)
where
    F: FnMut(usize),
{
    for r in clamped_span(row, rows) {
        for c in clamped_span(col, cols) {
            f(r * cols + c);
        }
    }
}

/// Uniform grid over the whole box, owned by a single worker.
#[derive(Debug, Clone)]
pub struct Grid {
    params: SimParams,
    cells: Vec<CellMembers>,
}

impl Grid {
    pub fn new(params: &SimParams) -> Self {
        let dim = params.grid_dim;
        Grid {
            params: params.clone(),
            cells: vec![CellMembers::new(); dim * dim],
        }
    }

    /// Builds a grid and inserts every particle of `particles`.
    pub fn with_particles(params: &SimParams, particles: &[Particle]) -> Self {
        let mut grid = Self::new(params);
        for (idx, particle) in particles.iter().enumerate() {
            grid.insert(idx, particle);
        }
        grid
    }

    pub fn dim(&self) -> usize {
        self.params.grid_dim
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    /// (row, col) of a particle; rows follow `x`, columns follow `y`.
    #[inline(always)]
    pub fn coordinates(&self, particle: &Particle) -> (usize, usize) {
        (
            self.params.grid_coordinate(particle.x),
            self.params.grid_coordinate(particle.y),
        )
    }

    /// Canonical cell of a particle's current position.
    #[inline(always)]
    pub fn cell_index(&self, particle: &Particle) -> usize {
        let (row, col) = self.coordinates(particle);
        row * self.params.grid_dim + col
    }

    pub fn insert(&mut self, idx: usize, particle: &Particle) {
        let cell = self.cell_index(particle);
        self.cells[cell].push(idx);
    }

    /// Unlinks `idx` from `cell`, the cell it was last known to occupy.
    pub fn remove(&mut self, idx: usize, cell: usize) -> Result<(), GridError> {
        let cells = self.cells.len();
        let members = self
            .cells
            .get_mut(cell)
            .ok_or(GridError::CellOutOfRange { cell, cells })?;
        unlink(members, idx, cell)
    }

    /// Moves `idx` to the cell of its current position if that differs from `old_cell`.
    /// Returns the cell the particle occupies afterwards.
    pub fn reclassify(&mut self, idx: usize, particle: &Particle, old_cell: usize) -> Result<usize, GridError> {
        let new_cell = self.cell_index(particle);
        if new_cell != old_cell {
            self.remove(idx, old_cell)?;
            self.cells[new_cell].push(idx);
        }
        Ok(new_cell)
    }

    pub fn cell(&self, cell: usize) -> &[usize] {
        &self.cells[cell]
    }

    /// Calls `f` for every member of the 3x3 cell block around `particle`,
    /// the particle itself included.
    #[inline(always)]
    pub fn for_each_neighbor<F>(&self, particle: &Particle, mut f: F)
    where
        F: FnMut(usize),
    {
        let (row, col) = self.coordinates(particle);
        let dim = self.params.grid_dim;
        for_each_neighbor_cell(row, col, dim, dim, |cell| {
            for &member in &self.cells[cell] {
                f(member);
            }
        });
    }

    /// Cells whose membership list contains `idx`.
    pub fn cells_containing(&self, idx: usize) -> Vec<usize> {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, members)| members.contains(&idx))
            .map(|(cell, _)| cell)
            .collect()
    }

    pub fn member_count(&self) -> usize {
        self.cells.iter().map(|members| members.len()).sum()
    }
}
