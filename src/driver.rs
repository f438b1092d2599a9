//! Parallel fusion driver.
//!
//! Splits the ground-truth rows into contiguous chunks and runs one
//! [`RecordAssembler`] per chunk on a rayon pool. Each worker owns its
//! resolver and index cache; the fusion inputs are shared read-only.
//! Outputs are concatenated in chunk order once every worker has finished.
//!
//! If the pool cannot be built or a worker panics, the whole run is
//! repeated sequentially over the same chunks, which yields the same table.

use crate::assembler::{ChunkOutput, FusionInputs, RecordAssembler};
use crate::config::DEFAULT_MAX_WORKERS;
use crate::error::{FusionError, Result};
use crate::models::{ExecutionMode, FusedTable, FusionStats, Observation};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Contiguous row ranges covering `0..total_rows`.
///
/// Chunk count is `min(workers, total_rows)` and chunk size is
/// `ceil(total_rows / workers)`, so the last chunk may be shorter.
pub fn plan_chunks(total_rows: usize, workers: usize) -> Vec<Range<usize>> {
    if total_rows == 0 {
        return Vec::new();
    }
    let workers = workers.max(1);
    let chunk_size = total_rows.div_ceil(workers);

    (0..total_rows)
        .step_by(chunk_size)
        .map(|start| start..(start + chunk_size).min(total_rows))
        .collect()
}

/// Runs the assembler over every ground-truth row
#[derive(Debug, Clone)]
pub struct FusionDriver {
    max_workers: usize,
    mode: ExecutionMode,
    show_progress: bool,
}

impl Default for FusionDriver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WORKERS)
    }
}

impl FusionDriver {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
            mode: ExecutionMode::Parallel,
            show_progress: false,
        }
    }

    /// Force sequential execution
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Chunk count used for a run: available cores capped by `max_workers`
    pub fn worker_count(&self) -> usize {
        num_cpus::get().min(self.max_workers).max(1)
    }

    /// Fuse every ground-truth row in `inputs`
    pub fn run(&self, inputs: &FusionInputs) -> Result<(FusedTable, FusionStats)> {
        let chunks = plan_chunks(inputs.primary.len(), self.worker_count());
        self.run_chunks(inputs, &chunks)
    }

    /// Fuse over an explicit chunk plan
    pub fn run_chunks(
        &self,
        inputs: &FusionInputs,
        chunks: &[Range<usize>],
    ) -> Result<(FusedTable, FusionStats)> {
        let start = Instant::now();
        let rows = inputs.primary.observations();
        check_plan(chunks, rows.len())?;

        info!(
            "Fusing {} ground-truth rows against {} auxiliary sources in {} chunks",
            rows.len(),
            inputs.sources.len(),
            chunks.len()
        );

        let (outputs, mode) = self.execute(rows, chunks, |chunk| {
            RecordAssembler::new(inputs).assemble_rows(chunk)
        });

        let mut table = inputs.empty_table();
        let mut stats = FusionStats {
            chunks: chunks.len(),
            mode,
            ..Default::default()
        };
        for output in outputs {
            stats.absorb(&output.stats);
            table.records.extend(output.records);
        }

        info!(
            "Fused {} of {} rows ({} without co-pollutant, {} without a value, {} incomplete) in {:.2?} ({})",
            stats.fused_rows,
            stats.ground_truth_rows,
            stats.dropped_missing_co_pollutant,
            stats.dropped_missing_primary,
            stats.dropped_incomplete,
            start.elapsed(),
            stats.mode
        );

        Ok((table, stats))
    }

    /// Run `work` over each chunk, returning outputs in chunk order and the
    /// mode that produced them.
    pub(crate) fn execute<F>(
        &self,
        rows: &[Observation],
        chunks: &[Range<usize>],
        work: F,
    ) -> (Vec<ChunkOutput>, ExecutionMode)
    where
        F: Fn(&[Observation]) -> ChunkOutput + Sync,
    {
        let progress = self.progress_bar(chunks.len());

        if self.mode == ExecutionMode::Sequential || chunks.len() <= 1 {
            let outputs = run_sequential(rows, chunks, &work, &progress);
            progress.finish_and_clear();
            return (outputs, ExecutionMode::Sequential);
        }

        match run_parallel(rows, chunks, &work, &progress) {
            Ok(outputs) => {
                progress.finish_and_clear();
                (outputs, ExecutionMode::Parallel)
            }
            Err(e) => {
                warn!("{}; re-running all chunks sequentially", e);
                progress.reset();
                let outputs = run_sequential(rows, chunks, &work, &progress);
                progress.finish_and_clear();
                (outputs, ExecutionMode::Sequential)
            }
        }
    }

    fn progress_bar(&self, chunks: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new(chunks as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb.set_message("Fusing");
        pb
    }
}

fn check_plan(chunks: &[Range<usize>], total_rows: usize) -> Result<()> {
    let mut expected = 0;
    for chunk in chunks {
        if chunk.start != expected || chunk.end < chunk.start {
            return Err(FusionError::configuration(format!(
                "chunk {:?} does not continue from row {}",
                chunk, expected
            )));
        }
        expected = chunk.end;
    }
    if expected != total_rows {
        return Err(FusionError::configuration(format!(
            "chunks cover {} of {} rows",
            expected, total_rows
        )));
    }
    Ok(())
}

fn run_sequential<F>(
    rows: &[Observation],
    chunks: &[Range<usize>],
    work: &F,
    progress: &ProgressBar,
) -> Vec<ChunkOutput>
where
    F: Fn(&[Observation]) -> ChunkOutput,
{
    chunks
        .iter()
        .map(|chunk| {
            let output = work(&rows[chunk.clone()]);
            progress.inc(1);
            output
        })
        .collect()
}

fn run_parallel<F>(
    rows: &[Observation],
    chunks: &[Range<usize>],
    work: &F,
    progress: &ProgressBar,
) -> Result<Vec<ChunkOutput>>
where
    F: Fn(&[Observation]) -> ChunkOutput + Sync,
{
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(chunks.len())
        .thread_name(|i| format!("fusion-worker-{}", i))
        .build()
        .map_err(|e| FusionError::WorkerPool {
            reason: format!("failed to start worker pool: {}", e),
        })?;

    debug!("Started worker pool with {} threads", chunks.len());

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        pool.install(|| {
            chunks
                .par_iter()
                .map(|chunk| {
                    let output = work(&rows[chunk.clone()]);
                    progress.inc(1);
                    output
                })
                .collect::<Vec<_>>()
        })
    }));

    result.map_err(|payload| {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        FusionError::WorkerPool {
            reason: format!("fusion worker panicked: {}", detail),
        }
    })
}
