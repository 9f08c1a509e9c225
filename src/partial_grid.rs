//! Row-banded decomposition of the full grid.
//!
//! Rank `r` owns absolute rows `[r * rows_per_rank, (r + 1) * rows_per_rank)`, the last
//! rank also absorbing the remainder. A `PartialGrid` holds only its own rows; particles
//! in any other row map to `None`.

use crate::grid::{clamped_span, for_each_neighbor_cell, unlink, CellMembers, GridError};
use crate::particle::Particle;
use anyhow::Result;
use particle_common::SimParams;

/// Which adjacent band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The band holding the rows just below `row_start`.
    Lower,
    /// The band holding the rows from `row_end` up.
    Upper,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Lower, Side::Upper];

    pub(crate) fn slot(self) -> usize {
        match self {
            Side::Lower => 0,
            Side::Upper => 1,
        }
    }
}

/// The contiguous absolute rows owned by one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Band {
    pub rank: usize,
    pub row_start: usize,
    pub row_end: usize,
}

impl Band {
    pub fn rows(&self) -> usize {
        self.row_end - self.row_start
    }

    pub fn contains_row(&self, row: usize) -> bool {
        row >= self.row_start && row < self.row_end
    }
}

/// Partition table shared by every rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandLayout {
    grid_dim: usize,
    ranks: usize,
    rows_per_rank: usize,
}

impl BandLayout {
    pub fn new(grid_dim: usize, ranks: usize) -> Result<Self> {
        if ranks == 0 {
            anyhow::bail!("A band layout needs at least one rank.");
        }
        if ranks > grid_dim {
            anyhow::bail!(
                "Cannot split {} grid rows over {} ranks: every rank needs a row.",
                grid_dim,
                ranks
            );
        }
        Ok(BandLayout {
            grid_dim,
            ranks,
            rows_per_rank: grid_dim / ranks,
        })
    }

    pub fn rows_per_rank(&self) -> usize {
        self.rows_per_rank
    }

    pub fn band(&self, rank: usize) -> Band {
        let row_start = self.rows_per_rank * rank;
        let row_end = if rank == self.ranks - 1 {
            self.grid_dim
        } else {
            row_start + self.rows_per_rank
        };
        Band { rank, row_start, row_end }
    }

    pub fn bands(&self) -> impl Iterator<Item = Band> + '_ {
        (0..self.ranks).map(|rank| self.band(rank))
    }

    /// Rank owning an absolute row.
    pub fn owner_of_row(&self, row: usize) -> usize {
        (row / self.rows_per_rank).min(self.ranks - 1)
    }

    /// Rank of the neighbouring band on `side`, if there is one.
    pub fn neighbor(&self, rank: usize, side: Side) -> Option<usize> {
        match side {
            Side::Lower => rank.checked_sub(1),
            Side::Upper => (rank + 1 < self.ranks).then_some(rank + 1),
        }
    }
}

/// One rank's slice of the grid: `band.rows() x grid_dim` cells.
#[derive(Debug, Clone)]
pub struct PartialGrid {
    params: SimParams,
    band: Band,
    cells: Vec<CellMembers>,
}

impl PartialGrid {
    pub fn new(params: &SimParams, band: Band) -> Self {
        PartialGrid {
            params: params.clone(),
            band,
            cells: vec![CellMembers::new(); band.rows() * params.grid_dim],
        }
    }

    pub fn band(&self) -> Band {
        self.band
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    /// Inserts every particle that falls in this band; returns how many did.
    pub fn populate(&mut self, particles: &[Particle]) -> usize {
        let mut inserted = 0;
        for (idx, particle) in particles.iter().enumerate() {
            if self.insert(idx, particle) {
                inserted += 1;
            }
        }
        inserted
    }

    #[inline(always)]
    pub fn absolute_row(&self, particle: &Particle) -> usize {
        self.params.grid_coordinate(particle.x)
    }

    /// Row within the band, `None` outside it.
    #[inline(always)]
    pub fn relative_row(&self, absolute_row: usize) -> Option<usize> {
        self.band
            .contains_row(absolute_row)
            .then(|| absolute_row - self.band.row_start)
    }

    /// Local cell of a particle, `None` when its row belongs to another rank.
    #[inline(always)]
    pub fn cell_index(&self, particle: &Particle) -> Option<usize> {
        let rel_row = self.relative_row(self.absolute_row(particle))?;
        let col = self.params.grid_coordinate(particle.y);
        Some(rel_row * self.params.grid_dim + col)
    }

    /// Inserts a particle that maps into this band. Particles outside it are ignored.
    pub fn insert(&mut self, idx: usize, particle: &Particle) -> bool {
        match self.cell_index(particle) {
            Some(cell) => {
                self.cells[cell].push(idx);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, idx: usize, cell: usize) -> Result<(), GridError> {
        let cells = self.cells.len();
        let members = self
            .cells
            .get_mut(cell)
            .ok_or(GridError::CellOutOfRange { cell, cells })?;
        unlink(members, idx, cell)
    }

    /// Like the full grid, except a particle that left the band is removed and not
    /// re-inserted. Returns its new local cell, `None` when it has left.
    pub fn reclassify(&mut self, idx: usize, particle: &Particle, old_cell: usize) -> Result<Option<usize>, GridError> {
        let new_cell = self.cell_index(particle);
        if new_cell != Some(old_cell) {
            self.remove(idx, old_cell)?;
            if let Some(cell) = new_cell {
                self.cells[cell].push(idx);
            }
        }
        Ok(new_cell)
    }

    /// Members of the 3x3 block around a particle of this band, clamped to the band's rows.
    #[inline(always)]
    pub fn for_each_neighbor<F>(&self, particle: &Particle, mut f: F)
    where
        F: FnMut(usize),
    {
        let Some(rel_row) = self.relative_row(self.absolute_row(particle)) else {
            return;
        };
        let col = self.params.grid_coordinate(particle.y);
        let dim = self.params.grid_dim;
        for_each_neighbor_cell(rel_row, col, self.band.rows(), dim, |cell| {
            for &member in &self.cells[cell] {
                f(member);
            }
        });
    }

    /// Every tracked particle, in row-major cell order.
    pub fn owned_ids(&self) -> Vec<usize> {
        self.cells.iter().flat_map(|members| members.iter().copied()).collect()
    }

    pub fn contains(&self, idx: usize) -> bool {
        self.cells.iter().any(|members| members.contains(&idx))
    }

    pub fn member_count(&self) -> usize {
        self.cells.iter().map(|members| members.len()).sum()
    }
}

/// Copies of the particles sitting in the single row just outside each edge of a band,
/// indexed by column. They take part in force accumulation but are owned elsewhere.
#[derive(Debug, Clone)]
pub struct Halo {
    params: SimParams,
    band: Band,
    rows: [Option<usize>; 2],
    cells: [Vec<CellMembers>; 2],
}

impl Halo {
    pub fn new(params: &SimParams, band: Band) -> Self {
        let lower = band.row_start.checked_sub(1);
        let upper = (band.row_end < params.grid_dim).then_some(band.row_end);
        let columns = |row: Option<usize>| match row {
            Some(_) => vec![CellMembers::new(); params.grid_dim],
            None => Vec::new(),
        };
        Halo {
            params: params.clone(),
            band,
            rows: [lower, upper],
            cells: [columns(lower), columns(upper)],
        }
    }

    /// Absolute row mirrored on `side`.
    pub fn row(&self, side: Side) -> Option<usize> {
        self.rows[side.slot()]
    }

    pub fn clear(&mut self) {
        for side in &mut self.cells {
            for members in side.iter_mut() {
                members.clear();
            }
        }
    }

    /// Records a copy if the particle sits in one of the two mirrored rows.
    pub fn insert(&mut self, idx: usize, particle: &Particle) -> bool {
        let row = self.params.grid_coordinate(particle.x);
        let col = self.params.grid_coordinate(particle.y);
        for side in Side::BOTH {
            if self.rows[side.slot()] == Some(row) {
                self.cells[side.slot()][col].push(idx);
                return true;
            }
        }
        false
    }

    /// Rebuilds from a full particle array, as available right after the broadcast.
    pub fn rebuild(&mut self, particles: &[Particle]) {
        self.clear();
        for (idx, particle) in particles.iter().enumerate() {
            self.insert(idx, particle);
        }
    }

    /// Mirrored members adjacent to a particle on the first or last row of the band.
    #[inline(always)]
    pub fn for_each_neighbor<F>(&self, particle: &Particle, mut f: F)
    where
        F: FnMut(usize),
    {
        let row = self.params.grid_coordinate(particle.x);
        let col = self.params.grid_coordinate(particle.y);
        let edges = [
            (Side::Lower, row == self.band.row_start),
            (Side::Upper, row + 1 == self.band.row_end),
        ];
        for (side, on_edge) in edges {
            if !on_edge || self.rows[side.slot()].is_none() {
                continue;
            }
            let columns = &self.cells[side.slot()];
            for c in clamped_span(col, self.params.grid_dim) {
                for &member in &columns[c] {
                    f(member);
                }
            }
        }
    }

    pub fn contains(&self, idx: usize) -> bool {
        self.cells
            .iter()
            .flat_map(|side| side.iter())
            .any(|members| members.contains(&idx))
    }

    pub fn len(&self) -> usize {
        self.cells
            .iter()
            .flat_map(|side| side.iter())
            .map(|members| members.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 6x6 grid over a 3x3 box.
    fn params() -> SimParams {
        SimParams {
            particle_count: 0,
            size: 3.0,
            cutoff: 0.5,
            cutoff_sq: 0.25,
            inv_cutoff: 2.0,
            grid_dim: 6,
            min_r_sq: 0.005 * 0.005,
            mass: 0.01,
            dt: 0.0005,
        }
    }

    #[test]
    fn bands_tile_every_row_exactly_once() {
        for grid_dim in 1..40 {
            for ranks in 1..=grid_dim {
                let layout = BandLayout::new(grid_dim, ranks).unwrap();
                for row in 0..grid_dim {
                    let owners: Vec<usize> = layout
                        .bands()
                        .filter(|band| band.contains_row(row))
                        .map(|band| band.rank)
                        .collect();
                    assert_eq!(owners.len(), 1, "row {} of {} over {} ranks", row, grid_dim, ranks);
                    assert_eq!(owners[0], layout.owner_of_row(row));
                }
            }
        }
    }

    #[test]
    fn last_rank_absorbs_remainder_rows() {
        let layout = BandLayout::new(10, 3).unwrap();
        assert_eq!(layout.band(0), Band { rank: 0, row_start: 0, row_end: 3 });
        assert_eq!(layout.band(1), Band { rank: 1, row_start: 3, row_end: 6 });
        assert_eq!(layout.band(2), Band { rank: 2, row_start: 6, row_end: 10 });
        assert_eq!(layout.owner_of_row(9), 2);
    }

    #[test]
    fn layout_rejects_more_ranks_than_rows() {
        assert!(BandLayout::new(4, 5).is_err());
        assert!(BandLayout::new(4, 0).is_err());
    }

    #[test]
    fn neighbors_exist_only_inside_the_line() {
        let layout = BandLayout::new(6, 3).unwrap();
        assert_eq!(layout.neighbor(0, Side::Lower), None);
        assert_eq!(layout.neighbor(0, Side::Upper), Some(1));
        assert_eq!(layout.neighbor(2, Side::Lower), Some(1));
        assert_eq!(layout.neighbor(2, Side::Upper), None);
    }

    #[test]
    fn partial_grid_maps_only_its_own_rows() {
        let params = params();
        let layout = BandLayout::new(6, 3).unwrap();
        let grid = PartialGrid::new(&params, layout.band(1));
        assert_eq!(grid.num_cells(), 12);

        let inside = Particle::new(0, 1.2, 0.7, 0.0, 0.0); // abs row 2, col 1
        let below = Particle::new(1, 0.9, 0.7, 0.0, 0.0); // abs row 1
        let above = Particle::new(2, 2.1, 0.7, 0.0, 0.0); // abs row 4
        assert_eq!(grid.cell_index(&inside), Some(1));
        assert_eq!(grid.cell_index(&below), None);
        assert_eq!(grid.cell_index(&above), None);
    }

    #[test]
    fn insert_outside_band_is_a_noop() {
        let params = params();
        let layout = BandLayout::new(6, 3).unwrap();
        let mut grid = PartialGrid::new(&params, layout.band(0));
        assert!(!grid.insert(0, &Particle::new(0, 2.9, 0.1, 0.0, 0.0)));
        assert_eq!(grid.member_count(), 0);
    }

    #[test]
    fn reclassify_out_of_band_removes_without_reinserting() {
        let params = params();
        let layout = BandLayout::new(6, 3).unwrap();
        let mut grid = PartialGrid::new(&params, layout.band(0));
        let mut p = Particle::new(0, 0.9, 0.2, 0.0, 0.0);
        assert!(grid.insert(0, &p));
        let old = grid.cell_index(&p).unwrap();

        p.x = 1.05;
        assert_eq!(grid.reclassify(0, &p, old).unwrap(), None);
        assert!(!grid.contains(0));
        assert_eq!(grid.member_count(), 0);
    }

    #[test]
    fn populate_splits_particles_between_bands() {
        let params = params();
        let layout = BandLayout::new(6, 4).unwrap();
        let particles: Vec<Particle> = (0..30)
            .map(|i| Particle::new(i, 0.05 + 0.1 * i as f64, 1.0, 0.0, 0.0))
            .collect();
        let total: usize = layout
            .bands()
            .map(|band| PartialGrid::new(&params, band).populate(&particles))
            .sum();
        assert_eq!(total, particles.len());
    }

    #[test]
    fn neighbor_search_is_clamped_to_the_band() {
        let params = params();
        let layout = BandLayout::new(6, 3).unwrap();
        let particles = vec![
            Particle::new(0, 1.1, 1.1, 0.0, 0.0), // abs row 2 (first row of band 1)
            Particle::new(1, 1.6, 1.3, 0.0, 0.0), // abs row 3
            Particle::new(2, 0.9, 1.1, 0.0, 0.0), // abs row 1, band 0
        ];
        let mut grid = PartialGrid::new(&params, layout.band(1));
        grid.populate(&particles);
        let mut seen = Vec::new();
        grid.for_each_neighbor(&particles[0], |j| seen.push(j));
        seen.sort();
        assert_eq!(seen, vec![0, 1]);
    }

    #[test]
    fn halo_mirrors_rows_adjacent_to_the_band() {
        let params = params();
        let layout = BandLayout::new(6, 3).unwrap();
        let band = layout.band(1);
        let mut halo = Halo::new(&params, band);
        assert_eq!(halo.row(Side::Lower), Some(1));
        assert_eq!(halo.row(Side::Upper), Some(4));

        let particles = vec![
            Particle::new(0, 1.1, 1.1, 0.0, 0.0), // abs row 2, local edge
            Particle::new(1, 0.9, 1.3, 0.0, 0.0), // abs row 1, lower halo col 2
            Particle::new(2, 0.6, 2.9, 0.0, 0.0), // abs row 1, col 5: too far sideways
            Particle::new(3, 0.4, 1.1, 0.0, 0.0), // abs row 0: not mirrored
            Particle::new(4, 2.2, 1.1, 0.0, 0.0), // abs row 4, upper halo
        ];
        halo.rebuild(&particles);
        assert_eq!(halo.len(), 3);
        assert!(!halo.contains(3));

        let mut seen = Vec::new();
        halo.for_each_neighbor(&particles[0], |j| seen.push(j));
        assert_eq!(seen, vec![1]);

        // A particle on the upper edge row sees the upper halo only
        let upper_edge = Particle::new(5, 1.7, 1.1, 0.0, 0.0);
        seen.clear();
        halo.for_each_neighbor(&upper_edge, |j| seen.push(j));
        assert_eq!(seen, vec![4]);
    }

    #[test]
    fn outermost_bands_have_one_sided_halos() {
        let params = params();
        let layout = BandLayout::new(6, 2).unwrap();
        let first = Halo::new(&params, layout.band(0));
        let last = Halo::new(&params, layout.band(1));
        assert_eq!(first.row(Side::Lower), None);
        assert_eq!(first.row(Side::Upper), Some(3));
        assert_eq!(last.row(Side::Lower), Some(2));
        assert_eq!(last.row(Side::Upper), None);
    }
}
