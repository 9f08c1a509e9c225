use anyhow::Result;
use particle_common::{SimParams, Snapshot};
use rand::distr::Uniform;
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use std::ops::{Index, IndexMut};

/// One point particle. `id` is its stable index in every worker's particle array.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Particle {
    pub id: i64,
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub ax: f64,
    pub ay: f64,
}

impl Particle {
    /// Reserved id marking the end of one step's migration stream.
    pub const END_OF_STEP_ID: i64 = -1;

    pub fn new(id: usize, x: f64, y: f64, vx: f64, vy: f64) -> Self {
        Particle { id: id as i64, x, y, vx, vy, ax: 0.0, ay: 0.0 }
    }

    pub fn end_of_step() -> Self {
        Particle { id: Self::END_OF_STEP_ID, ..Particle::default() }
    }

    #[inline(always)]
    pub fn is_end_of_step(&self) -> bool {
        self.id == Self::END_OF_STEP_ID
    }

    #[inline(always)]
    pub fn reset_acceleration(&mut self) {
        self.ax = 0.0;
        self.ay = 0.0;
    }
}

/// Owns every particle record of one worker, indexed by id.
#[derive(Debug, Clone)]
pub struct ParticleStore {
    particles: Vec<Particle>,
    size: f64,
}

impl ParticleStore {
    pub fn from_particles(particles: Vec<Particle>, size: f64) -> Self {
        ParticleStore { particles, size }
    }

    /// Spreads `params.particle_count` particles over a shuffled lattice so none overlap,
    /// with velocities drawn uniformly from [-1, 1) per component.
    pub fn generate(params: &SimParams, seed: u64) -> Result<Self> {
        let n = params.particle_count;
        if n == 0 {
            anyhow::bail!("Cannot generate an empty particle set.");
        }
        let size = params.size;
        let mut rng = StdRng::seed_from_u64(seed);
        let velocity_dist = Uniform::new(-1.0f64, 1.0f64)?;

        let sx = (n as f64).sqrt().ceil() as usize;
        let sy = (n + sx - 1) / sx;

        let mut shuffle: Vec<usize> = (0..n).collect();
        let mut particles = Vec::with_capacity(n);

        for i in 0..n {
            // Make sure particles are not spatially sorted
            let j = rng.random_range(0..n - i);
            let k = shuffle[j];
            shuffle[j] = shuffle[n - i - 1];

            let x = size * (1.0 + (k % sx) as f64) / (1 + sx) as f64;
            let y = size * (1.0 + (k / sx) as f64) / (1 + sy) as f64;
            let vx = rng.sample(velocity_dist);
            let vy = rng.sample(velocity_dist);

            particles.push(Particle::new(i, x, y, vx, vy));
        }

        Ok(ParticleStore { particles, size })
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Particle> {
        self.particles.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Particle> {
        self.particles.iter_mut()
    }

    pub fn as_slice(&self) -> &[Particle] {
        &self.particles
    }

    pub fn as_mut_slice(&mut self) -> &mut [Particle] {
        &mut self.particles
    }

    pub fn into_vec(self) -> Vec<Particle> {
        self.particles
    }

    pub fn snapshot(&self, step: u32) -> Snapshot {
        snapshot_of(&self.particles, self.size, step)
    }
}

impl Index<usize> for ParticleStore {
    type Output = Particle;

    fn index(&self, index: usize) -> &Particle {
        &self.particles[index]
    }
}

impl IndexMut<usize> for ParticleStore {
    fn index_mut(&mut self, index: usize) -> &mut Particle {
        &mut self.particles[index]
    }
}

/// Builds a frame from particles already ordered by id.
pub fn snapshot_of(particles: &[Particle], size: f64, step: u32) -> Snapshot {
    Snapshot {
        step,
        size,
        positions: particles.iter().map(|p| (p.x, p.y)).collect(),
    }
}
