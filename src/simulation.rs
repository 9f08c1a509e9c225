use crate::distributed::run_distributed;
use crate::dump::DumpWriter;
use crate::grid::Grid;
use crate::particle::{Particle, ParticleStore};
use crate::physics::{apply_force, move_particle};
use crate::threaded::{run_shared, Launcher};
use anyhow::Result;
use log::{debug, info, trace, warn};
use particle_common::{ExecutionMode, SimParams, SimulationConfig};
use std::io::Write;
use std::time::{Duration, Instant};

/// Outcome of a full run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub mode: ExecutionMode,
    pub particle_count: usize,
    pub steps: u32,
    pub frames_saved: usize,
    pub elapsed: Duration,
    /// Final state, ordered by particle id.
    pub particles: Vec<Particle>,
}

/// Periodic progress line, at most once per interval.
pub(crate) struct StepProgress {
    total_steps: u32,
    start: Instant,
    last_print: Instant,
    interval: Duration,
}

impl StepProgress {
    pub(crate) fn new(total_steps: u32) -> Self {
        let now = Instant::now();
        StepProgress {
            total_steps,
            start: now,
            last_print: now,
            interval: Duration::from_secs(5),
        }
    }

    pub(crate) fn step_done(&mut self, step: u32, step_duration: Duration) {
        let now = Instant::now();
        let is_last_step = step + 1 == self.total_steps;
        if is_last_step || now.duration_since(self.last_print) >= self.interval {
            info!(
                "Step [{}/{}] | Step Time: {:6.3} ms | Elapsed: {:.2} s",
                step + 1,
                self.total_steps,
                step_duration.as_secs_f64() * 1000.0,
                self.start.elapsed().as_secs_f64()
            );
            self.last_print = now;
        } else {
            trace!(
                "Step [{}/{}] completed in {:.3} ms",
                step + 1,
                self.total_steps,
                step_duration.as_secs_f64() * 1000.0
            );
        }
    }
}

/// Single-threaded driver over the full grid.
pub struct SerialSimulation {
    params: SimParams,
    store: ParticleStore,
    grid: Grid,
    /// Number of completed steps.
    pub current_time_step: u32,
}

impl SerialSimulation {
    pub fn new(store: ParticleStore, params: &SimParams) -> Self {
        let grid = Grid::with_particles(params, store.as_slice());
        SerialSimulation {
            params: params.clone(),
            store,
            grid,
            current_time_step: 0,
        }
    }

    /// Advances every particle by one `dt`.
    pub fn step(&mut self) -> Result<()> {
        self.accumulate_forces();
        self.move_particles()?;
        self.current_time_step += 1;
        Ok(())
    }

    /// Resets and accumulates every particle's acceleration from its 3x3 cell block.
    fn accumulate_forces(&mut self) {
        let particles = self.store.as_mut_slice();
        for i in 0..particles.len() {
            let origin = particles[i];
            let mut particle = origin;
            particle.reset_acceleration();
            self.grid.for_each_neighbor(&origin, |j| {
                if j != i {
                    apply_force(&mut particle, &particles[j], &self.params);
                }
            });
            particles[i] = particle;
        }
    }

    fn move_particles(&mut self) -> Result<()> {
        for i in 0..self.store.len() {
            let particle = &mut self.store[i];
            let old_cell = self.grid.cell_index(particle);
            move_particle(particle, &self.params);
            self.grid.reclassify(i, particle, old_cell)?;
        }
        Ok(())
    }

    /// Runs `steps` steps, saving a frame after every step divisible by `save_frequency`.
    /// Returns the number of frames saved.
    pub fn run<W: Write>(
        &mut self,
        steps: u32,
        save_frequency: u32,
        mut sink: Option<&mut DumpWriter<W>>,
    ) -> Result<usize> {
        if save_frequency == 0 {
            anyhow::bail!("save_frequency must be greater than 0.");
        }
        let mut progress = StepProgress::new(steps);
        let mut frames = 0;
        for step in 0..steps {
            let step_start = Instant::now();
            self.step()?;
            progress.step_done(step, step_start.elapsed());

            if let Some(sink) = sink.as_deref_mut() {
                if step % save_frequency == 0 {
                    sink.write_snapshot(&self.store.snapshot(step))?;
                    frames += 1;
                }
            }
        }
        Ok(frames)
    }

    pub fn particles(&self) -> &[Particle] {
        self.store.as_slice()
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn params(&self) -> &SimParams {
        &self.params
    }

    pub fn into_particles(self) -> Vec<Particle> {
        self.store.into_vec()
    }
}

/// Generates the particles from the configured seed and runs the configured mode.
pub fn run<W: Write + Send>(
    config: &SimulationConfig,
    sink: Option<&mut DumpWriter<W>>,
) -> Result<RunSummary> {
    config.validate()?;
    let params = config.get_sim_params();
    let store = ParticleStore::generate(&params, config.run.seed)?;
    info!(
        "Generated {} particles in a {:.4} x {:.4} box ({}x{} grid).",
        store.len(),
        params.size,
        params.size,
        params.grid_dim,
        params.grid_dim
    );
    run_with_store(config, store, sink)
}

/// Validates the configuration and runs the configured mode on an existing particle set.
pub fn run_with_store<W: Write + Send>(
    config: &SimulationConfig,
    store: ParticleStore,
    mut sink: Option<&mut DumpWriter<W>>,
) -> Result<RunSummary> {
    config.validate()?;
    let params = config.get_sim_params();
    if store.len() != params.particle_count {
        anyhow::bail!(
            "Particle store holds {} particles but the configuration expects {}.",
            store.len(),
            params.particle_count
        );
    }

    let run = &config.run;
    if run.mode != ExecutionMode::Serial && run.worker_count as usize > store.len() {
        warn!(
            "{} workers for {} particles: some workers will own nothing.",
            run.worker_count,
            store.len()
        );
    }
    info!(
        "Running {} steps in {} mode with {} worker(s).",
        run.step_count, run.mode, run.worker_count
    );

    let start = Instant::now();
    let (particles, frames_saved) = match run.mode {
        ExecutionMode::Serial => {
            let mut sim = SerialSimulation::new(store, &params);
            let frames = sim.run(run.step_count, run.save_frequency, sink.as_deref_mut())?;
            (sim.into_particles(), frames)
        }
        ExecutionMode::Threads => run_shared(&store, &params, run, Launcher::ScopedThreads, sink)?,
        ExecutionMode::Rayon => run_shared(&store, &params, run, Launcher::RayonPool, sink)?,
        ExecutionMode::Distributed => run_distributed(&store, &params, run, sink)?,
    };
    let elapsed = start.elapsed();
    debug!("{} frames saved.", frames_saved);

    Ok(RunSummary {
        mode: run.mode,
        particle_count: particles.len(),
        steps: run.step_count,
        frames_saved,
        elapsed,
        particles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 2x2 grid: the cutoff is half the box.
    fn params() -> SimParams {
        SimParams {
            particle_count: 4,
            size: 1.0,
            cutoff: 0.5,
            cutoff_sq: 0.25,
            inv_cutoff: 2.0,
            grid_dim: 2,
            min_r_sq: 0.005 * 0.005,
            mass: 0.01,
            dt: 0.0005,
        }
    }

    #[test]
    fn near_pair_accelerates_and_far_pair_does_not() {
        let particles = vec![
            Particle::new(0, 0.10, 0.10, 0.0, 0.0),
            Particle::new(1, 0.30, 0.20, 0.0, 0.0),
            Particle::new(2, 0.95, 0.05, 0.0, 0.0),
            Particle::new(3, 0.05, 0.95, 0.0, 0.0),
        ];
        let params = params();
        let mut sim = SerialSimulation::new(ParticleStore::from_particles(particles, params.size), &params);
        sim.accumulate_forces();

        let ps = sim.particles();
        for near in &ps[..2] {
            assert!(near.ax != 0.0 && near.ay != 0.0, "near particle {} should accelerate", near.id);
        }
        for far in &ps[2..] {
            assert_eq!((far.ax, far.ay), (0.0, 0.0), "far particle {} should not", far.id);
        }
        // Equal and opposite, though computed independently
        assert!((ps[0].ax + ps[1].ax).abs() < 1e-9);
        assert!((ps[0].ay + ps[1].ay).abs() < 1e-9);
    }

    #[test]
    fn acceleration_is_reset_every_step() {
        let params = params();
        let mut lone = Particle::new(0, 0.5, 0.5, 0.0, 0.0);
        lone.ax = 123.0;
        let mut sim = SerialSimulation::new(ParticleStore::from_particles(vec![lone], params.size), &params);
        sim.step().unwrap();
        assert_eq!(sim.particles()[0].ax, 0.0);
        assert_eq!(sim.particles()[0].x, 0.5);
    }

    #[test]
    fn membership_tracks_positions_after_many_steps() {
        let mut config = SimulationConfig::default();
        config.run.particle_count = 150;
        let params = config.get_sim_params();
        let store = ParticleStore::generate(&params, 5).unwrap();
        let mut sim = SerialSimulation::new(store, &params);
        for _ in 0..200 {
            sim.step().unwrap();
        }
        for (idx, p) in sim.particles().iter().enumerate() {
            assert_eq!(sim.grid().cells_containing(idx), vec![sim.grid().cell_index(p)]);
        }
    }

    #[test]
    fn frames_are_saved_on_multiples_of_the_frequency() {
        let mut config = SimulationConfig::default();
        config.run.particle_count = 20;
        let params = config.get_sim_params();
        let store = ParticleStore::generate(&params, 1).unwrap();
        let mut sim = SerialSimulation::new(store, &params);
        let mut dump = DumpWriter::new(Vec::new());
        let frames = sim.run(25, 10, Some(&mut dump)).unwrap();
        // Steps 0, 10 and 20
        assert_eq!(frames, 3);
        let text = String::from_utf8(dump.into_inner().unwrap()).unwrap();
        assert_eq!(text.lines().count(), 1 + 3 * 20);
    }

    #[test]
    fn zero_save_frequency_is_an_error_in_every_mode() {
        for mode in ExecutionMode::ALL {
            let mut config = SimulationConfig::default();
            config.run.particle_count = 20;
            config.run.step_count = 5;
            config.run.worker_count = 2;
            config.run.save_frequency = 0;
            config.run.mode = mode;
            let params = config.get_sim_params();
            let store = ParticleStore::generate(&params, 1).unwrap();
            let mut dump = DumpWriter::new(Vec::new());
            assert!(run_with_store(&config, store, Some(&mut dump)).is_err(), "{}", mode);
            assert_eq!(dump.frames_written(), 0);
        }
    }

    #[test]
    fn serial_driver_rejects_zero_save_frequency() {
        let mut config = SimulationConfig::default();
        config.run.particle_count = 10;
        let params = config.get_sim_params();
        let store = ParticleStore::generate(&params, 1).unwrap();
        let mut sim = SerialSimulation::new(store, &params);
        let mut dump = DumpWriter::new(Vec::new());
        assert!(sim.run(3, 0, Some(&mut dump)).is_err());
        assert_eq!(sim.current_time_step, 0);
    }

    #[test]
    fn run_rejects_invalid_configuration() {
        let mut config = SimulationConfig::default();
        config.run.particle_count = 0;
        assert!(run::<Vec<u8>>(&config, None).is_err());
    }
}
