use super::channel::{Communicator, MigrationError};
use crate::grid::GridError;
use crate::partial_grid::{BandLayout, Halo, PartialGrid, Side};
use crate::particle::Particle;
use crate::physics::{apply_force, move_particle};
use log::{debug, trace};
use particle_common::SimParams;

/// One rank of the distributed run.
///
/// Every rank keeps a copy of the whole particle array, indexed by id, but only the
/// entries referenced by its partial grid are authoritative. Records of particles owned
/// elsewhere are refreshed when a neighbour sends them and are otherwise stale.
pub struct RankWorker {
    rank: usize,
    layout: BandLayout,
    params: SimParams,
    particles: Vec<Particle>,
    grid: PartialGrid,
    halo: Halo,
    comm: Communicator,
}

impl RankWorker {
    /// `particles` is the broadcast array; this rank tracks whatever falls in its band.
    pub fn new(comm: Communicator, layout: BandLayout, params: &SimParams, particles: Vec<Particle>) -> Self {
        let rank = comm.rank();
        let band = layout.band(rank);
        let mut grid = PartialGrid::new(params, band);
        let owned = grid.populate(&particles);
        let mut halo = Halo::new(params, band);
        halo.rebuild(&particles);
        debug!(
            "Rank {} owns rows {}..{} with {} particles, {} mirrored.",
            rank,
            band.row_start,
            band.row_end,
            owned,
            halo.len()
        );
        RankWorker {
            rank,
            layout,
            params: params.clone(),
            particles,
            grid,
            halo,
            comm,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn grid(&self) -> &PartialGrid {
        &self.grid
    }

    pub fn halo(&self) -> &Halo {
        &self.halo
    }

    pub fn member_count(&self) -> usize {
        self.grid.member_count()
    }

    /// This rank's copy of a particle record, authoritative or not.
    pub fn particle(&self, id: usize) -> &Particle {
        &self.particles[id]
    }

    pub fn owns(&self, id: usize) -> bool {
        self.grid.contains(id)
    }

    /// Copies of the particles this rank currently owns, in cell order.
    pub fn owned_particles(&self) -> Vec<Particle> {
        self.grid.owned_ids().into_iter().map(|i| self.particles[i]).collect()
    }

    /// One full step: local work and outgoing messages, then incoming messages.
    pub fn step(&mut self) -> Result<(), MigrationError> {
        self.dispatch()?;
        self.collect()?;
        Ok(())
    }

    /// Computes forces for owned particles, moves them and sends each neighbour the
    /// records it needs, closed by the end-of-step sentinel.
    pub fn dispatch(&mut self) -> Result<(), MigrationError> {
        let owned = self.grid.owned_ids();
        self.accumulate_forces(&owned);
        // Mirrored copies are only valid for the force phase they were built for
        self.halo.clear();

        let mut sent = [0usize; 2];
        for &i in &owned {
            let mut particle = self.particles[i];
            let old_cell = self
                .grid
                .cell_index(&particle)
                .ok_or(GridError::Untracked { particle: i })?;
            move_particle(&mut particle, &self.params);
            self.particles[i] = particle;
            self.grid.reclassify(i, &particle, old_cell)?;

            for side in self.destinations(&particle)? {
                trace!(
                    "Rank {} sends particle {} at ({:.6}, {:.6}) to its {:?} neighbour.",
                    self.rank,
                    particle.id,
                    particle.x,
                    particle.y,
                    side
                );
                self.comm.send(side, &particle)?;
                sent[side.slot()] += 1;
            }
            if self.grid.cell_index(&particle).is_none() {
                self.halo.insert(i, &particle);
            }
        }

        for side in Side::BOTH {
            if self.comm.has_neighbor(side) {
                self.comm.send_end_of_step(side)?;
            }
        }
        trace!("Rank {} sent {} records down and {} up.", self.rank, sent[0], sent[1]);
        Ok(())
    }

    /// Drains the lower neighbour's stream, then the upper one's, each up to its
    /// sentinel. Returns how many records arrived.
    pub fn collect(&mut self) -> Result<usize, MigrationError> {
        let mut received = 0;
        for side in Side::BOTH {
            if !self.comm.has_neighbor(side) {
                continue;
            }
            while let Some(particle) = self.comm.recv(side)? {
                self.place_received(particle)?;
                received += 1;
            }
        }
        trace!("Rank {} received {} records.", self.rank, received);
        Ok(received)
    }

    fn accumulate_forces(&mut self, owned: &[usize]) {
        for &i in owned {
            let origin = self.particles[i];
            let mut particle = origin;
            particle.reset_acceleration();
            let particles = &self.particles;
            let params = &self.params;
            self.grid.for_each_neighbor(&origin, |j| {
                if j != i {
                    apply_force(&mut particle, &particles[j], params);
                }
            });
            self.halo.for_each_neighbor(&origin, |j| {
                if j != i {
                    apply_force(&mut particle, &particles[j], params);
                }
            });
            self.particles[i] = particle;
        }
    }

    /// Where a just-moved owned particle must be sent. Leavers go to the band they
    /// entered; particles on an edge row are mirrored to the band across that edge.
    fn destinations(&self, particle: &Particle) -> Result<Vec<Side>, MigrationError> {
        let band = self.grid.band();
        let row = self.grid.absolute_row(particle);
        match self.grid.relative_row(row) {
            None => {
                let target = self.layout.owner_of_row(row);
                let side = if target + 1 == self.rank {
                    Side::Lower
                } else if target == self.rank + 1 {
                    Side::Upper
                } else {
                    return Err(MigrationError::BandSkipped {
                        particle: particle.id,
                        from: self.rank,
                        to: target,
                    });
                };
                Ok(vec![side])
            }
            Some(rel_row) => {
                let mut sides = Vec::new();
                if rel_row == 0 && self.comm.has_neighbor(Side::Lower) {
                    sides.push(Side::Lower);
                }
                if rel_row + 1 == band.rows() && self.comm.has_neighbor(Side::Upper) {
                    sides.push(Side::Upper);
                }
                Ok(sides)
            }
        }
    }

    /// Overwrites the local copy and fixes up grid and halo membership.
    fn place_received(&mut self, particle: Particle) -> Result<(), MigrationError> {
        let idx = usize::try_from(particle.id)
            .ok()
            .filter(|&idx| idx < self.particles.len())
            .ok_or(MigrationError::UnknownParticle { id: particle.id })?;

        let old_cell = self.grid.cell_index(&self.particles[idx]);
        self.particles[idx] = particle;
        let new_cell = match old_cell {
            Some(old_cell) => self.grid.reclassify(idx, &particle, old_cell)?,
            None => {
                self.grid.insert(idx, &particle);
                self.grid.cell_index(&particle)
            }
        };
        if new_cell.is_none() {
            self.halo.insert(idx, &particle);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 4x4 grid over a 2x2 box.
    fn params() -> SimParams {
        SimParams {
            particle_count: 0,
            size: 2.0,
            cutoff: 0.5,
            cutoff_sq: 0.25,
            inv_cutoff: 2.0,
            grid_dim: 4,
            min_r_sq: 0.005 * 0.005,
            mass: 0.01,
            dt: 0.001,
        }
    }

    fn workers(params: &SimParams, ranks: usize, particles: &[Particle]) -> Vec<RankWorker> {
        let layout = BandLayout::new(params.grid_dim, ranks).unwrap();
        Communicator::line(ranks)
            .into_iter()
            .map(|comm| RankWorker::new(comm, layout.clone(), params, particles.to_vec()))
            .collect()
    }

    #[test]
    fn particle_crossing_the_band_edge_changes_owner() {
        let params = params();
        // Row 1 (rank 0's top row), heading up fast enough to reach row 2 in one step
        let particles = vec![
            Particle::new(0, 0.95, 1.0, 100.0, 0.0),
            Particle::new(1, 0.20, 0.2, 0.0, 0.0),
            Particle::new(2, 1.80, 1.8, 0.0, 0.0),
        ];
        let mut ws = workers(&params, 2, &particles);
        assert!(ws[0].owns(0) && ws[0].owns(1) && ws[1].owns(2));

        for w in ws.iter_mut() {
            w.dispatch().unwrap();
        }
        for w in ws.iter_mut() {
            w.collect().unwrap();
        }

        assert!(!ws[0].owns(0));
        assert!(ws[1].owns(0));
        assert_eq!(ws[1].particle(0), ws[0].particle(0));
        assert!((ws[1].particle(0).x - 1.05).abs() < 1e-12);
        // Row 2 borders rank 0, so rank 0 keeps a mirrored copy
        assert!(ws[0].halo().contains(0));
        assert_eq!(ws[0].member_count() + ws[1].member_count(), 3);
    }

    #[test]
    fn edge_rows_are_mirrored_without_changing_owner() {
        let params = params();
        let particles = vec![
            Particle::new(0, 0.90, 1.0, 0.0, 0.0), // rank 0 top row
            Particle::new(1, 1.10, 1.0, 0.0, 0.0), // rank 1 bottom row
            Particle::new(2, 0.20, 1.0, 0.0, 0.0), // rank 0 inner row
        ];
        let mut ws = workers(&params, 2, &particles);
        for w in ws.iter_mut() {
            w.dispatch().unwrap();
        }
        for w in ws.iter_mut() {
            w.collect().unwrap();
        }

        assert!(ws[0].owns(0) && ws[1].owns(1) && ws[0].owns(2));
        assert!(ws[1].halo().contains(0));
        assert!(ws[0].halo().contains(1));
        assert!(!ws[1].halo().contains(2));
    }

    #[test]
    fn pair_across_the_edge_feels_the_same_force_as_on_one_rank() {
        let params = params();
        let particles = vec![
            Particle::new(0, 0.90, 1.0, 0.0, 0.0),
            Particle::new(1, 1.10, 1.05, 0.0, 0.0),
        ];
        let mut split = workers(&params, 2, &particles);
        let mut whole = workers(&params, 1, &particles);
        whole[0].step().unwrap();
        // Single thread: every rank must send before any rank blocks on receiving
        for w in split.iter_mut() {
            w.dispatch().unwrap();
        }
        for w in split.iter_mut() {
            w.collect().unwrap();
        }
        // Single rank tracks both; in the split run rank 0 owns 0 and rank 1 owns 1
        assert_eq!(split[0].particle(0), whole[0].particle(0));
        assert_eq!(split[1].particle(1), whole[0].particle(1));
        assert!(whole[0].particle(0).vx < 0.0);
    }

    #[test]
    fn jumping_over_a_band_is_rejected() {
        // 6 rows over 3 ranks, two rows each
        let params = SimParams {
            size: 3.0,
            grid_dim: 6,
            dt: 0.01,
            ..params()
        };
        // Row 1 straight to row 4
        let particles = vec![Particle::new(0, 0.9, 1.0, 120.0, 0.0)];
        let mut ws = workers(&params, 3, &particles);
        assert!(ws[0].owns(0));
        let error = ws[0].dispatch().unwrap_err();
        assert!(matches!(error, MigrationError::BandSkipped { particle: 0, from: 0, to: 2 }));
    }

    #[test]
    fn unknown_ids_are_rejected() {
        let params = params();
        let mut ws = workers(&params, 2, &[Particle::new(0, 0.2, 0.2, 0.0, 0.0)]);
        let bogus = Particle { id: 7, ..Particle::new(0, 1.2, 0.2, 0.0, 0.0) };
        assert!(matches!(
            ws[1].place_received(bogus),
            Err(MigrationError::UnknownParticle { id: 7 })
        ));
    }
}
