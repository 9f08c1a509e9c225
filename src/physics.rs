//! Short-range repulsive force and the per-particle integrator.
//!
//! Both functions mutate only the particle passed by `&mut`, so each ordered pair
//! `(particle, neighbor)` is applied independently by whichever worker owns `particle`.

use crate::particle::Particle;
use particle_common::SimParams;

/// Accumulates the force `neighbor` exerts on `particle` into `particle.ax/ay`.
/// Pairs farther apart than the cutoff are ignored.
#[inline(always)]
pub fn apply_force(particle: &mut Particle, neighbor: &Particle, params: &SimParams) {
    let dx = neighbor.x - particle.x;
    let dy = neighbor.y - particle.y;
    let r2 = dx * dx + dy * dy;

    if r2 > params.cutoff_sq {
        return;
    }

    // Clamp to avoid the singularity at zero separation
    let r2 = r2.max(params.min_r_sq);
    let r = r2.sqrt();

    let coef = (1.0 - params.cutoff / r) / r2 / params.mass;
    particle.ax += coef * dx;
    particle.ay += coef * dy;
}

/// Velocity-then-position update followed by reflection off the four walls.
#[inline(always)]
pub fn move_particle(particle: &mut Particle, params: &SimParams) {
    let dt = params.dt;
    let size = params.size;

    particle.vx += particle.ax * dt;
    particle.vy += particle.ay * dt;
    particle.x += particle.vx * dt;
    particle.y += particle.vy * dt;

    // Repeat until inside: a fast particle can overshoot past the opposite wall
    while particle.x < 0.0 || particle.x > size {
        particle.x = if particle.x < 0.0 { -particle.x } else { 2.0 * size - particle.x };
        particle.vx = -particle.vx;
    }
    while particle.y < 0.0 || particle.y > size {
        particle.y = if particle.y < 0.0 { -particle.y } else { 2.0 * size - particle.y };
        particle.vy = -particle.vy;
    }
}
