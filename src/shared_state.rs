use crate::particle::Particle;
use std::sync::atomic::{AtomicU64, Ordering};

/// `f64` stored as its bit pattern so threads can share it without locks.
#[derive(Debug, Default)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        AtomicF64(AtomicU64::new(value.to_bits()))
    }

    #[inline(always)]
    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    #[inline(always)]
    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Particle array shared by every worker thread, laid out one vector per field.
///
/// Slot `i` is only ever written by the thread whose static range contains `i`; other
/// threads read its position during the force phase. The phase barrier orders those
/// accesses, so relaxed loads and stores are enough.
#[derive(Debug)]
pub struct SharedParticles {
    ids: Vec<i64>,
    positions_x: Vec<AtomicF64>,
    positions_y: Vec<AtomicF64>,
    velocities_x: Vec<AtomicF64>,
    velocities_y: Vec<AtomicF64>,
    accelerations_x: Vec<AtomicF64>,
    accelerations_y: Vec<AtomicF64>,
}

impl SharedParticles {
    pub fn from_particles(particles: &[Particle]) -> Self {
        let field = |get: fn(&Particle) -> f64| -> Vec<AtomicF64> {
            particles.iter().map(|p| AtomicF64::new(get(p))).collect()
        };
        SharedParticles {
            ids: particles.iter().map(|p| p.id).collect(),
            positions_x: field(|p| p.x),
            positions_y: field(|p| p.y),
            velocities_x: field(|p| p.vx),
            velocities_y: field(|p| p.vy),
            accelerations_x: field(|p| p.ax),
            accelerations_y: field(|p| p.ay),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[inline(always)]
    pub fn load(&self, idx: usize) -> Particle {
        Particle {
            id: self.ids[idx],
            x: self.positions_x[idx].load(),
            y: self.positions_y[idx].load(),
            vx: self.velocities_x[idx].load(),
            vy: self.velocities_y[idx].load(),
            ax: self.accelerations_x[idx].load(),
            ay: self.accelerations_y[idx].load(),
        }
    }

    /// Position only, for neighbours read during the force phase.
    #[inline(always)]
    pub fn load_position(&self, idx: usize) -> Particle {
        Particle {
            id: self.ids[idx],
            x: self.positions_x[idx].load(),
            y: self.positions_y[idx].load(),
            ..Particle::default()
        }
    }

    #[inline(always)]
    pub fn store(&self, idx: usize, particle: &Particle) {
        self.positions_x[idx].store(particle.x);
        self.positions_y[idx].store(particle.y);
        self.velocities_x[idx].store(particle.vx);
        self.velocities_y[idx].store(particle.vy);
        self.accelerations_x[idx].store(particle.ax);
        self.accelerations_y[idx].store(particle.ay);
    }

    #[inline(always)]
    pub fn store_acceleration(&self, idx: usize, ax: f64, ay: f64) {
        self.accelerations_x[idx].store(ax);
        self.accelerations_y[idx].store(ay);
    }

    pub fn to_particles(&self) -> Vec<Particle> {
        (0..self.len()).map(|idx| self.load(idx)).collect()
    }
}
