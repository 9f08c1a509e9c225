//! Shared-memory driver: one particle array and one locked grid for every worker.
//!
//! Worker `k` owns the static slice `[k * n / T, (k + 1) * n / T)` of the particle array.
//! Each step is two phases separated by a barrier: forces (read any position, write
//! own accelerations) and moves (write own positions, relink own grid memberships).

use crate::dump::DumpWriter;
use crate::locked_grid::LockedGrid;
use crate::particle::{snapshot_of, Particle, ParticleStore};
use crate::physics::{apply_force, move_particle};
use crate::shared_state::SharedParticles;
use crate::simulation::StepProgress;
use anyhow::{Context, Result};
use log::{debug, info};
use parking_lot::Mutex;
use particle_common::{RunConfig, SimParams};
use std::io::Write;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Barrier;
use std::time::Instant;

/// How the worker threads are started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launcher {
    /// One `std::thread::scope` thread per worker.
    ScopedThreads,
    /// A dedicated rayon pool running the worker body on every pool thread.
    RayonPool,
}

/// Static slice of the particle array owned by `worker`.
pub fn partition(worker: usize, workers: usize, particle_count: usize) -> Range<usize> {
    (worker * particle_count / workers)..((worker + 1) * particle_count / workers)
}

/// Phase barrier plus the abort flag. A worker that fails records its error, raises the
/// flag and still reaches the next barrier; everyone checks the flag right after it.
struct RunControl {
    barrier: Barrier,
    failed: AtomicBool,
    error: Mutex<Option<anyhow::Error>>,
}

impl RunControl {
    fn new(workers: usize) -> Self {
        RunControl {
            barrier: Barrier::new(workers),
            failed: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    fn fail(&self, error: anyhow::Error) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
        self.failed.store(true, Ordering::SeqCst);
    }

    fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    fn take_error(&self) -> Option<anyhow::Error> {
        self.error.lock().take()
    }
}

/// Everything the workers share for one run.
pub struct SharedSimulation<'a, W: Write> {
    params: SimParams,
    particles: SharedParticles,
    grid: LockedGrid,
    workers: usize,
    steps: u32,
    save_frequency: u32,
    control: RunControl,
    sink: Mutex<Option<&'a mut DumpWriter<W>>>,
    frames_saved: AtomicUsize,
}

impl<'a, W: Write + Send> SharedSimulation<'a, W> {
    pub fn new(
        store: &ParticleStore,
        params: &SimParams,
        run: &RunConfig,
        sink: Option<&'a mut DumpWriter<W>>,
    ) -> Result<Self> {
        run.validate()?;
        let workers = run.worker_count as usize;
        Ok(SharedSimulation {
            params: params.clone(),
            particles: SharedParticles::from_particles(store.as_slice()),
            grid: LockedGrid::with_particles(params, store.as_slice()),
            workers,
            steps: run.step_count,
            save_frequency: run.save_frequency,
            control: RunControl::new(workers),
            sink: Mutex::new(sink),
            frames_saved: AtomicUsize::new(0),
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn grid(&self) -> &LockedGrid {
        &self.grid
    }

    pub fn particles(&self) -> Vec<Particle> {
        self.particles.to_particles()
    }

    /// Starts every worker and waits for all of them.
    pub fn launch(&self, launcher: Launcher) -> Result<()> {
        match launcher {
            Launcher::ScopedThreads => {
                std::thread::scope(|s| {
                    for k in 0..self.workers {
                        s.spawn(move || self.worker(k));
                    }
                });
            }
            Launcher::RayonPool => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(self.workers)
                    .thread_name(|k| format!("particle-worker-{}", k))
                    .build()
                    .context("Failed to build the worker thread pool")?;
                debug!("Broadcasting worker body to {} pool threads.", pool.current_num_threads());
                pool.broadcast(|ctx| self.worker(ctx.index()));
            }
        }

        match self.control.take_error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// The per-thread step loop. Every exit point is right after a barrier, so all
    /// workers leave at the same step.
    fn worker(&self, k: usize) {
        let range = partition(k, self.workers, self.particles.len());
        debug!("Worker {} owns particles {:?}.", k, range);
        let mut progress = (k == 0).then(|| StepProgress::new(self.steps));

        for step in 0..self.steps {
            let step_start = Instant::now();

            if !self.control.has_failed() {
                self.accumulate_forces(range.clone());
            }
            self.control.barrier.wait();
            if self.control.has_failed() {
                break;
            }

            if let Err(e) = self.move_particles(range.clone()) {
                self.control.fail(e.context(format!("Worker {} failed to move its particles at step {}", k, step)));
            }
            self.control.barrier.wait();
            if self.control.has_failed() {
                break;
            }

            if let Some(progress) = progress.as_mut() {
                if step % self.save_frequency == 0 {
                    if let Err(e) = self.save(step) {
                        self.control.fail(e);
                    }
                }
                progress.step_done(step, step_start.elapsed());
            }
        }
    }

    fn accumulate_forces(&self, range: Range<usize>) {
        for i in range {
            let origin = self.particles.load_position(i);
            let mut particle = origin;
            particle.reset_acceleration();
            self.grid.for_each_neighbor(&origin, |j| {
                if j != i {
                    apply_force(&mut particle, &self.particles.load_position(j), &self.params);
                }
            });
            self.particles.store_acceleration(i, particle.ax, particle.ay);
        }
    }

    fn move_particles(&self, range: Range<usize>) -> Result<()> {
        for i in range {
            let mut particle = self.particles.load(i);
            let old_cell = self.grid.cell_index(&particle);
            move_particle(&mut particle, &self.params);
            self.particles.store(i, &particle);
            self.grid.reclassify(i, &particle, old_cell)?;
        }
        Ok(())
    }

    /// Runs on worker 0 between the move barrier and the next force phase, while
    /// positions are stable.
    fn save(&self, step: u32) -> Result<()> {
        let mut sink = self.sink.lock();
        if let Some(sink) = sink.as_deref_mut() {
            let particles = self.particles.to_particles();
            sink.write_snapshot(&snapshot_of(&particles, self.params.size, step))?;
            self.frames_saved.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn frames_saved(&self) -> usize {
        self.frames_saved.load(Ordering::Relaxed)
    }
}

/// Runs the shared-memory modes. Returns the final particles and the number of frames saved.
pub fn run_shared<W: Write + Send>(
    store: &ParticleStore,
    params: &SimParams,
    run: &RunConfig,
    launcher: Launcher,
    sink: Option<&mut DumpWriter<W>>,
) -> Result<(Vec<Particle>, usize)> {
    let sim = SharedSimulation::new(store, params, run, sink)?;
    info!("Launching {} workers ({:?}).", sim.workers(), launcher);
    sim.launch(launcher)?;
    Ok((sim.particles(), sim.frames_saved()))
}
