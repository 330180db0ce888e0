//! Optional per-iteration CSV trace.
//!
//! One row per engine step; loadable straight into pandas or duckdb for
//! scheduling analysis. Bit-exactness across runs is not a goal.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// One engine iteration, flattened.
#[derive(Debug, Clone)]
pub struct TraceRow {
    pub iteration: u64,
    pub ts_start: f64,
    pub ts_end: f64,
    pub n_running: usize,
    pub n_waiting: usize,
    pub n_swapped: usize,
    pub tokens_batched: usize,
    pub n_scheduled: usize,
    pub preempted: usize,
    pub swapped_in_blocks: usize,
    pub swapped_out_blocks: usize,
    pub copied_blocks: usize,
}

/// Buffered CSV writer for [`TraceRow`]s.
pub struct TraceRecorder {
    writer: BufWriter<File>,
}

impl TraceRecorder {
    pub fn create(path: &Path) -> io::Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(
            writer,
            "iteration,ts_start,ts_end,n_running,n_waiting,n_swapped,\
             tokens_batched,n_scheduled,preempted,swapped_in_blocks,\
             swapped_out_blocks,copied_blocks"
        )?;
        Ok(Self { writer })
    }

    pub fn record(&mut self, row: &TraceRow) -> io::Result<()> {
        writeln!(
            self.writer,
            "{},{:.6},{:.6},{},{},{},{},{},{},{},{},{}",
            row.iteration,
            row.ts_start,
            row.ts_end,
            row.n_running,
            row.n_waiting,
            row.n_swapped,
            row.tokens_batched,
            row.n_scheduled,
            row.preempted,
            row.swapped_in_blocks,
            row.swapped_out_blocks,
            row.copied_blocks,
        )
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
