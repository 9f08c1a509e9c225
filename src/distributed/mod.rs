//! Distributed driver: the grid is cut into row bands, one rank per band, and ranks
//! exchange particle records with their two neighbours only.
//!
//! Ranks run as threads here, but share nothing except the links built by
//! [`Communicator::line`] and the snapshot collector owned by the driver.

pub mod channel;
pub mod migration;

pub use channel::{Communicator, MigrationError};
pub use migration::RankWorker;

use crate::dump::DumpWriter;
use crate::partial_grid::BandLayout;
use crate::particle::{snapshot_of, Particle, ParticleStore};
use crate::simulation::StepProgress;
use anyhow::{Context, Result};
use crossbeam::channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};
use particle_common::{RunConfig, SimParams};
use std::collections::BTreeMap;
use std::io::Write;
use std::time::Instant;

/// The particles one rank owned at the end of a saved step.
#[derive(Debug)]
struct BandFrame {
    step: u32,
    rank: usize,
    particles: Vec<Particle>,
}

/// Orders the union of every rank's particles by id and checks it is exactly `0..n`.
pub fn merge_bands(mut particles: Vec<Particle>, expected: usize) -> Result<Vec<Particle>, MigrationError> {
    particles.sort_by_key(|p| p.id);
    let complete = particles.len() == expected
        && particles.iter().enumerate().all(|(i, p)| p.id == i as i64);
    if !complete {
        particles.dedup_by_key(|p| p.id);
        return Err(MigrationError::CountMismatch {
            expected,
            found: particles.len(),
        });
    }
    Ok(particles)
}

fn run_rank(
    mut worker: RankWorker,
    steps: u32,
    save_frequency: u32,
    frames: Option<Sender<BandFrame>>,
) -> Result<Vec<Particle>> {
    let rank = worker.rank();
    let mut progress = (rank == 0).then(|| StepProgress::new(steps));

    for step in 0..steps {
        let step_start = Instant::now();
        worker
            .step()
            .with_context(|| format!("Rank {} failed at step {}", rank, step))?;

        if let Some(frames) = &frames {
            if step % save_frequency == 0 {
                let frame = BandFrame {
                    step,
                    rank,
                    particles: worker.owned_particles(),
                };
                frames
                    .send(frame)
                    .map_err(|_| anyhow::anyhow!("Rank {}: snapshot collector stopped", rank))?;
            }
        }
        if let Some(progress) = progress.as_mut() {
            progress.step_done(step, step_start.elapsed());
        }
    }

    debug!("Rank {} finished owning {} particles.", rank, worker.member_count());
    Ok(worker.owned_particles())
}

/// Receives band frames while the ranks run and writes each step once every rank has
/// reported it. Returns the number of frames written.
fn write_frames<W: Write>(
    frames: Receiver<BandFrame>,
    ranks: usize,
    particle_count: usize,
    size: f64,
    sink: &mut DumpWriter<W>,
) -> Result<usize> {
    let mut pending: BTreeMap<u32, (usize, Vec<Particle>)> = BTreeMap::new();
    let mut written = 0;
    for frame in frames.iter() {
        let entry = pending.entry(frame.step).or_insert_with(|| (0, Vec::with_capacity(particle_count)));
        entry.0 += 1;
        entry.1.extend(frame.particles);
        debug!("Rank {} reported step {} ({}/{}).", frame.rank, frame.step, entry.0, ranks);

        if entry.0 == ranks {
            if let Some((_, particles)) = pending.remove(&frame.step) {
                let particles = merge_bands(particles, particle_count)
                    .with_context(|| format!("Gathering step {}", frame.step))?;
                sink.write_snapshot(&snapshot_of(&particles, size, frame.step))?;
                written += 1;
            }
        }
    }
    if !pending.is_empty() {
        anyhow::bail!("{} saved steps never heard from every rank", pending.len());
    }
    Ok(written)
}

/// Picks the error to report when ranks fail. A broken link is usually the echo of a
/// neighbour's failure, so any other error wins over `Disconnected`.
fn first_cause(errors: Vec<anyhow::Error>) -> Option<anyhow::Error> {
    let is_echo = |e: &anyhow::Error| {
        matches!(
            e.downcast_ref::<MigrationError>(),
            Some(MigrationError::Disconnected { .. })
        ) || e.to_string().contains("snapshot collector stopped")
    };
    let mut echoes = Vec::new();
    for error in errors {
        if is_echo(&error) {
            echoes.push(error);
        } else {
            return Some(error);
        }
    }
    echoes.into_iter().next()
}

/// Runs the distributed mode. Returns the final particles and the number of frames saved.
pub fn run_distributed<W: Write + Send>(
    store: &ParticleStore,
    params: &SimParams,
    run: &RunConfig,
    sink: Option<&mut DumpWriter<W>>,
) -> Result<(Vec<Particle>, usize)> {
    run.validate()?;
    let ranks = run.worker_count as usize;
    let layout = BandLayout::new(params.grid_dim, ranks)?;
    info!(
        "Splitting {} grid rows over {} ranks ({} rows each, last rank takes the rest).",
        params.grid_dim,
        ranks,
        layout.rows_per_rank()
    );
    let max_step = params.max_band_displacement(layout.rows_per_rank());
    debug!("Largest per-step displacement the bands tolerate: {:.6}", max_step);
    if layout.rows_per_rank() < 2 && ranks > 1 {
        warn!("Single-row bands: a particle crossing a whole band in one step is mirrored one step late.");
    }

    let save_frequency = run.save_frequency;
    let (frame_tx, frame_rx) = unbounded();
    let frame_tx = sink.is_some().then_some(frame_tx);

    let workers: Vec<RankWorker> = Communicator::line(ranks)
        .into_iter()
        .map(|comm| RankWorker::new(comm, layout.clone(), params, store.as_slice().to_vec()))
        .collect();

    let (results, written) = std::thread::scope(|s| {
        let handles: Vec<_> = workers
            .into_iter()
            .map(|worker| {
                let frames = frame_tx.clone();
                s.spawn(move || run_rank(worker, run.step_count, save_frequency, frames))
            })
            .collect();
        // Only the ranks hold senders now, so the receiver ends when they all finish
        drop(frame_tx);

        let written = match sink {
            Some(sink) => write_frames(frame_rx, ranks, store.len(), params.size, sink),
            None => Ok(0),
        };

        let results: Vec<Result<Vec<Particle>>> = handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("Rank {} panicked", rank)))
            })
            .collect();
        (results, written)
    });

    let mut particles = Vec::with_capacity(store.len());
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(owned) => particles.extend(owned),
            Err(e) => errors.push(e),
        }
    }
    // A failed rank also starves the writer, so the writer's error goes last
    let frames_saved = match written {
        Ok(frames) => frames,
        Err(e) => {
            errors.push(e);
            0
        }
    };
    if let Some(error) = first_cause(errors) {
        return Err(error);
    }

    let particles = merge_bands(particles, store.len())?;
    info!("All {} particles accounted for across {} ranks.", particles.len(), ranks);
    Ok((particles, frames_saved))
}
