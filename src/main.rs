use anyhow::Result;
use clap::Parser;
use log::{debug, error, info};
use particle_common::{ExecutionMode, SimulationConfig};
use particle_engine::{run, DumpWriter, RunReport};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Short-range particle simulation on a cell grid", long_about = None)]
struct Args {
    /// Optional TOML configuration; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of particles
    #[arg(short = 'n', long = "particle-num")]
    particle_num: Option<u32>,

    /// Number of steps
    #[arg(short = 's', long = "steps")]
    steps: Option<u32>,

    /// Dump file for saved frames
    #[arg(short = 'o', long = "filename")]
    filename: Option<PathBuf>,

    /// Save a frame every this many steps
    #[arg(short = 'f', long = "frequency")]
    frequency: Option<u32>,

    /// Threads, or ranks in distributed mode
    #[arg(short = 't', long = "workers")]
    workers: Option<u32>,

    /// serial, threads, rayon or distributed
    #[arg(long)]
    mode: Option<ExecutionMode>,

    /// Seed for particle generation
    #[arg(long)]
    seed: Option<u64>,

    /// Write a JSON run report here
    #[arg(long)]
    report: Option<PathBuf>,
}

impl Args {
    fn apply_to(&self, config: &mut SimulationConfig) {
        if let Some(n) = self.particle_num {
            config.run.particle_count = n;
        }
        if let Some(steps) = self.steps {
            config.run.step_count = steps;
        }
        if let Some(frequency) = self.frequency {
            config.run.save_frequency = frequency;
        }
        if let Some(workers) = self.workers {
            config.run.worker_count = workers;
        }
        if let Some(mode) = self.mode {
            config.run.mode = mode;
        }
        if let Some(seed) = self.seed {
            config.run.seed = seed;
        }
        if let Some(filename) = &self.filename {
            config.output.dump_path = Some(filename.clone());
        }
        if let Some(report) = &self.report {
            config.output.report_path = Some(report.clone());
        }
    }
}

fn load_config(args: &Args) -> Result<SimulationConfig> {
    let mut config = match &args.config {
        Some(path) => SimulationConfig::load(path)?,
        None => SimulationConfig::default(),
    };
    args.apply_to(&mut config);
    config.validate()?;
    Ok(config)
}

fn simulate(config: &SimulationConfig) -> Result<()> {
    let run_config = &config.run;
    info!(
        "Particles: {} | Steps: {} | Save every: {} | Mode: {} | Workers: {} | Seed: {}",
        run_config.particle_count,
        run_config.step_count,
        run_config.save_frequency,
        run_config.mode,
        run_config.worker_count,
        run_config.seed
    );
    debug!("Simulation Parameters: {:#?}", config.get_sim_params());

    let summary = match &config.output.dump_path {
        Some(path) => {
            let file = File::create(path)
                .map_err(|e| anyhow::anyhow!("Failed to create dump file '{}': {}", path.display(), e))?;
            let mut dump = DumpWriter::new(BufWriter::new(file));
            let summary = run(config, Some(&mut dump))?;
            dump.flush()?;
            info!("{} frames saved to {}", dump.frames_written(), path.display());
            summary
        }
        None => run::<BufWriter<File>>(config, None)?,
    };

    info!("Time: {} us", summary.elapsed.as_micros());
    println!("Time: {} us", summary.elapsed.as_micros());

    if let Some(path) = &config.output.report_path {
        RunReport::new(&summary, run_config.worker_count).write_json(path)?;
        info!("Run report written to {}", path.display());
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    info!("Starting Particle Engine...");
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {:#}", e);
            return Err(e);
        }
    };

    if let Err(e) = simulate(&config) {
        error!("Simulation failed: {:#}", e);
        return Err(e);
    }
    Ok(())
}
