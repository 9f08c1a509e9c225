use crate::simulation::RunSummary;
use anyhow::{Context, Result};
use particle_common::ExecutionMode;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Machine-readable run statistics, written next to the dump when requested.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub mode: ExecutionMode,
    pub particle_count: usize,
    pub step_count: u32,
    pub worker_count: u32,
    pub frames_saved: usize,
    pub elapsed_us: u128,
}

impl RunReport {
    pub fn new(summary: &RunSummary, worker_count: u32) -> Self {
        RunReport {
            mode: summary.mode,
            particle_count: summary.particle_count,
            step_count: summary.steps,
            worker_count: if summary.mode == ExecutionMode::Serial { 1 } else { worker_count },
            frames_saved: summary.frames_saved,
            elapsed_us: summary.elapsed.as_micros(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize run report")
    }

    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create report file '{}'", path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}
