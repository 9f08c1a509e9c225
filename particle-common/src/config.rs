use serde::{Deserialize, Serialize};
use anyhow::Result;
use crate::sim_params::SimParams;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// How the per-step work is spread across workers.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One thread, full grid.
    Serial,
    /// Scoped OS threads sharing a lock-per-cell grid.
    Threads,
    /// Same protocol as `Threads`, run on a dedicated rayon pool.
    Rayon,
    /// Row-banded ranks with private particle copies and message-passing migration.
    Distributed,
}

impl ExecutionMode {
    pub const ALL: [ExecutionMode; 4] = [
        ExecutionMode::Serial,
        ExecutionMode::Threads,
        ExecutionMode::Rayon,
        ExecutionMode::Distributed,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ExecutionMode::Serial => "serial",
            ExecutionMode::Threads => "threads",
            ExecutionMode::Rayon => "rayon",
            ExecutionMode::Distributed => "distributed",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ExecutionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        ExecutionMode::ALL
            .iter()
            .copied()
            .find(|mode| mode.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow::anyhow!(
                "Unknown execution mode '{}' (expected serial, threads, rayon or distributed)", s
            ))
    }
}

// Run sizing, loaded from the [run] table
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct RunConfig {
    pub particle_count: u32,
    pub step_count: u32,
    pub save_frequency: u32,
    /// Threads for the shared-memory modes, ranks for the distributed mode.
    pub worker_count: u32,
    pub mode: ExecutionMode,
    pub seed: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            particle_count: 1000,
            step_count: 1000,
            save_frequency: 10,
            worker_count: 16,
            mode: ExecutionMode::Serial,
            seed: 42,
        }
    }
}

impl RunConfig {
    /// Counts and frequency must all be positive.
    pub fn validate(&self) -> Result<()> {
        if self.particle_count == 0 {
            anyhow::bail!("particle_count must be greater than 0.");
        }
        if self.step_count == 0 {
            anyhow::bail!("step_count must be greater than 0.");
        }
        if self.save_frequency == 0 {
            anyhow::bail!("save_frequency must be greater than 0.");
        }
        if self.worker_count == 0 {
            anyhow::bail!("worker_count must be greater than 0.");
        }
        Ok(())
    }
}

// Tuned physical constants, loaded from the [physics] table
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct PhysicsConfig {
    pub density: f64,
    pub mass: f64,
    /// Interaction cutoff, also the side of a grid cell.
    pub cutoff: f64,
    /// Minimum separation used to clamp r^2, as a fraction of the cutoff.
    pub min_r_fraction: f64,
    pub dt: f64,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        PhysicsConfig {
            density: 0.0005,
            mass: 0.01,
            cutoff: 0.01,
            min_r_fraction: 0.01,
            dt: 0.0005,
        }
    }
}

// Output settings, loaded from the [output] table
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(default)]
pub struct OutputConfig {
    /// Plain-text dump of particle positions. Nothing is saved when absent.
    pub dump_path: Option<PathBuf>,
    /// JSON run report written after the run.
    pub report_path: Option<PathBuf>,
}

// Main simulation configuration structure, loaded from an optional TOML file.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct SimulationConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub physics: PhysicsConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl SimulationConfig {
    /// Loads the simulation configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();

        let config_str = std::fs::read_to_string(path_ref)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path_ref.display(), e))?;
        let config = Self::from_toml_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse TOML from '{}': {}", path_ref.display(), e))?;

        Ok(config)
    }

    /// Parses a configuration from TOML text. Missing tables fall back to defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: SimulationConfig = toml::from_str(text)?;
        Ok(config)
    }

    /// Checks every field once, before the run starts. The config is immutable afterwards.
    pub fn validate(&self) -> Result<()> {
        let run = &self.run;
        let physics = &self.physics;
        run.validate()?;

        for (name, value) in [
            ("density", physics.density),
            ("mass", physics.mass),
            ("cutoff", physics.cutoff),
            ("dt", physics.dt),
        ] {
            if !value.is_finite() || value <= 0.0 {
                anyhow::bail!("{} must be a positive finite number (got {}).", name, value);
            }
        }
        if !(physics.min_r_fraction > 0.0 && physics.min_r_fraction <= 1.0) {
            anyhow::bail!("min_r_fraction must lie in (0, 1] (got {}).", physics.min_r_fraction);
        }

        if run.mode == ExecutionMode::Distributed {
            let grid_dim = self.get_sim_params().grid_dim;
            if run.worker_count as usize > grid_dim {
                anyhow::bail!(
                    "Distributed mode needs at least one grid row per rank: {} ranks for {} rows.",
                    run.worker_count,
                    grid_dim
                );
            }
        }

        Ok(())
    }

    /// Converts the configuration into simulation parameters used at runtime.
    pub fn get_sim_params(&self) -> SimParams {
        let physics = &self.physics;
        let particle_count = self.run.particle_count as usize;

        // Keep density constant: the box grows with the particle count
        let size = (physics.density * particle_count as f64).sqrt();
        let cutoff = physics.cutoff;
        let inv_cutoff = if cutoff > 0.0 { 1.0 / cutoff } else { 0.0 };
        let grid_dim = ((size * inv_cutoff).ceil() as usize).max(1);
        let min_r = cutoff * physics.min_r_fraction;

        SimParams {
            particle_count,
            size,
            cutoff,
            cutoff_sq: cutoff * cutoff,
            inv_cutoff,
            min_r_sq: min_r * min_r,
            mass: physics.mass,
            dt: physics.dt,
            grid_dim,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = SimulationConfig::from_toml_str("").unwrap();
        assert_eq!(config.run.particle_count, 1000);
        assert_eq!(config.run.step_count, 1000);
        assert_eq!(config.run.save_frequency, 10);
        assert_eq!(config.run.mode, ExecutionMode::Serial);
        assert_eq!(config.physics.cutoff, 0.01);
        assert!(config.output.dump_path.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn partial_tables_keep_remaining_defaults() {
        let config = SimulationConfig::from_toml_str(
            r#"
            [run]
            particle_count = 64
            mode = "distributed"
            worker_count = 2

            [output]
            dump_path = "out.dump"
            "#,
        )
        .unwrap();
        assert_eq!(config.run.particle_count, 64);
        assert_eq!(config.run.step_count, 1000);
        assert_eq!(config.run.mode, ExecutionMode::Distributed);
        assert_eq!(config.physics.dt, 0.0005);
        assert_eq!(config.output.dump_path, Some(PathBuf::from("out.dump")));
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("Rayon".parse::<ExecutionMode>().unwrap(), ExecutionMode::Rayon);
        assert_eq!("threads".parse::<ExecutionMode>().unwrap(), ExecutionMode::Threads);
        assert!("openmp".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn validation_rejects_zero_counts() {
        let mut config = SimulationConfig::default();
        config.run.step_count = 0;
        assert!(config.validate().is_err());

        let mut config = SimulationConfig::default();
        config.run.save_frequency = 0;
        assert!(config.validate().is_err());

        let mut config = SimulationConfig::default();
        config.physics.cutoff = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_more_ranks_than_rows() {
        let mut config = SimulationConfig::default();
        config.run.mode = ExecutionMode::Distributed;
        config.run.particle_count = 100;
        // size = sqrt(0.0005 * 100) ~ 0.2236, so 23 rows
        assert_eq!(config.get_sim_params().grid_dim, 23);
        config.run.worker_count = 23;
        config.validate().unwrap();
        config.run.worker_count = 24;
        assert!(config.validate().is_err());
    }

    #[test]
    fn derived_params_follow_density() {
        let mut config = SimulationConfig::default();
        config.run.particle_count = 1800;
        let params = config.get_sim_params();
        assert!((params.size - 0.9f64.sqrt()).abs() < 1e-12);
        assert_eq!(params.grid_dim, 95);
        assert!((params.cutoff_sq - 1e-4).abs() < 1e-16);
        assert!((params.min_r_sq - 1e-8).abs() < 1e-20);
    }
}
