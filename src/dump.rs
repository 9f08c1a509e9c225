use anyhow::Result;
use particle_common::Snapshot;
use std::io::Write;

/// Whitespace-delimited text dump: `count size` once, then `x y` per particle per frame.
///
/// Borrows an already-open writer; opening and closing the file is the caller's business.
pub struct DumpWriter<W: Write> {
    writer: csv::Writer<W>,
    header_written: bool,
    frames_written: usize,
}

impl<W: Write> DumpWriter<W> {
    pub fn new(inner: W) -> Self {
        let writer = csv::WriterBuilder::new()
            .delimiter(b' ')
            .has_headers(false)
            .flexible(true)
            .from_writer(inner);
        DumpWriter {
            writer,
            header_written: false,
            frames_written: 0,
        }
    }

    pub fn write_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        if !self.header_written {
            self.writer.write_record(&[
                snapshot.particle_count().to_string(),
                snapshot.size.to_string(),
            ])?;
            self.header_written = true;
        }
        for (x, y) in &snapshot.positions {
            self.writer.write_record(&[x.to_string(), y.to_string()])?;
        }
        self.frames_written += 1;
        log::debug!("Saved frame for step {} ({} particles).", snapshot.step, snapshot.particle_count());
        Ok(())
    }

    pub fn frames_written(&self) -> usize {
        self.frames_written
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes and hands back the underlying writer.
    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("Failed to flush dump writer: {}", e.error()))
    }
}
