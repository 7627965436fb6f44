use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

use crate::constants::BYTES_PER_MB;
use crate::external_sort::callbacks::{Flow, RecordOrder, RecordSink, RecordSource};
use crate::external_sort::context::SortContext;
use crate::external_sort::error::{Result, SortError};
use crate::external_sort::fanout::{partition_ranges, sort_fanout, PagedInput, PartitionedSource};
use crate::external_sort::internal::{sort_input, InternalOutcome};
use crate::external_sort::merge::{merge_runs, stream_single_run};
use crate::external_sort::record::{LineOrder, LineSink, LineSource};
use crate::external_sort::{ExternalSortConfig, ExternalSortStats};

pub struct ExternalSortProcessor {
    config: ExternalSortConfig,
}

impl ExternalSortProcessor {
    pub fn new(config: ExternalSortConfig) -> Result<Self> {
        config.validate().map_err(SortError::Config)?;
        std::fs::create_dir_all(&config.temp_directory)
            .map_err(SortError::temp_file("create directory"))?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ExternalSortConfig {
        &self.config
    }

    /// Sorts every record of `source` into `sink` on the calling thread.
    pub fn sort<S, K, O>(
        &self,
        source: &mut S,
        sink: &mut K,
        order: &O,
    ) -> Result<ExternalSortStats>
    where
        S: RecordSource,
        K: RecordSink,
        O: RecordOrder,
    {
        self.sort_serial(source, sink, order, self.config.estimated_input_pages)
    }

    /// Sorts a partitionable input, fanning out to parallel workers when
    /// requested and the input splits into at least two partitions.
    pub fn sort_partitioned<P, K, O>(
        &self,
        input: &P,
        sink: &mut K,
        order: &O,
    ) -> Result<ExternalSortStats>
    where
        P: PartitionedSource,
        K: RecordSink,
        O: RecordOrder,
    {
        let page_count = input.page_count();
        if self.config.parallel {
            let workers = self.config.parallel_workers;
            let ranges = partition_ranges(page_count, input.row_count(), workers);
            if !ranges.is_empty() {
                return self.sort_parallel(input, ranges, sink, order);
            }
            debug!(
                page_count,
                rows = input.row_count(),
                "input too small to fan out, sorting serially"
            );
        }

        let mut source = input.scan(0..page_count);
        let estimate = self.config.estimated_input_pages.or(Some(page_count));
        self.sort_serial(&mut *source, sink, order, estimate)
    }

    fn sort_serial(
        &self,
        source: &mut dyn RecordSource,
        sink: &mut dyn RecordSink,
        order: &dyn RecordOrder,
        estimate: Option<usize>,
    ) -> Result<ExternalSortStats> {
        let started = Instant::now();
        let mut ctx = SortContext::new(&self.config, order, estimate)?;

        let outcome = sort_input(&mut ctx, source, Some(&mut *sink))?;
        ctx.stats.sort_time_ms = started.elapsed().as_millis() as u64;

        let merge_started = Instant::now();
        let flow = match outcome {
            InternalOutcome::Streamed(flow) => flow,
            InternalOutcome::Spilled => match ctx.tot_runs {
                0 => Flow::Continue,
                1 => stream_single_run(&mut ctx, sink)?,
                _ => merge_runs(&mut ctx, Some(sink))?,
            },
        };
        ctx.stats.merge_time_ms = merge_started.elapsed().as_millis() as u64;

        let mut stats = ctx.stats.clone();
        stats.stopped_early = flow == Flow::Stop;
        stats.processing_time_ms = started.elapsed().as_millis() as u64;
        drop(ctx);

        self.report(&stats);
        Ok(stats)
    }

    fn sort_parallel(
        &self,
        input: &dyn PartitionedSource,
        ranges: Vec<std::ops::Range<usize>>,
        sink: &mut dyn RecordSink,
        order: &dyn RecordOrder,
    ) -> Result<ExternalSortStats> {
        let started = Instant::now();
        let mut stats = ExternalSortStats::default();
        debug!(workers = ranges.len(), pages = input.page_count(), "fanning out sort");

        let flow = sort_fanout(&self.config, input, ranges, order, sink, &mut stats)?;
        stats.stopped_early = flow == Flow::Stop;
        stats.processing_time_ms = started.elapsed().as_millis() as u64;

        self.report(&stats);
        Ok(stats)
    }

    /// Sorts newline-delimited records from `input_files` into `output_file`.
    pub fn sort_lines(
        &self,
        input_files: &[PathBuf],
        output_file: &Path,
    ) -> anyhow::Result<ExternalSortStats> {
        if let Some(parent) = output_file.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let order = LineOrder::from_config(&self.config);
        let mut source = LineSource::new(input_files.to_vec());
        let writer = BufWriter::new(File::create(output_file)?);
        let mut sink = LineSink::new(writer);

        let stats = if self.config.parallel {
            let input = PagedInput::from_source(&mut source, self.config.page_size)?;
            self.sort_partitioned(&input, &mut sink, &order)?
        } else {
            self.sort(&mut source, &mut sink, &order)?
        };

        sink.into_inner()?.flush()?;
        Ok(stats)
    }

    fn report(&self, stats: &ExternalSortStats) {
        info!(
            records = stats.records_fetched,
            emitted = stats.records_emitted,
            duplicates = stats.duplicates_removed,
            runs = stats.runs_created,
            passes = stats.merge_passes,
            workers = stats.workers,
            stopped_early = stats.stopped_early,
            elapsed_ms = stats.processing_time_ms,
            "external sort finished"
        );
        if self.config.verbose {
            debug!(
                buffer_mb =
                    (stats.buffer_pages * self.config.page_size) as f64 / BYTES_PER_MB as f64,
                half_files = stats.half_files,
                pages_written = stats.pages_written,
                pages_read = stats.pages_read,
                pass_through = stats.pass_through_copies,
                overflow = stats.overflow_records,
                retired = stats.temp_files_retired,
                "external sort details"
            );
        }
    }
}
