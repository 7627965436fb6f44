//! Parallel fan-out: the input is cut into contiguous page ranges, each range
//! is sorted by its own worker into a single on-disk run, and the coordinator
//! merges the worker runs once. Ties between workers follow partition order,
//! which keeps the output identical to a serial sort of the same input.

use std::ops::Range;
use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, error};

use crate::external_sort::callbacks::{FetchStatus, Flow, RecordOrder, RecordSink, RecordSource};
use crate::external_sort::config::ExternalSortConfig;
use crate::external_sort::context::{input_section_pages, total_buffer_pages, SortContext};
use crate::external_sort::error::{Result, SortError};
use crate::external_sort::internal::sort_input;
use crate::external_sort::merge::{merge_cursors, merge_runs, RunCursor};
use crate::external_sort::overflow::OverflowFile;
use crate::external_sort::temp_file::TempFile;
use crate::external_sort::ExternalSortStats;

/// Input that can be scanned by page range without being modified.
pub trait PartitionedSource: Sync {
    fn page_count(&self) -> usize;
    fn row_count(&self) -> usize;
    fn scan(&self, pages: Range<usize>) -> Box<dyn RecordSource + Send + '_>;
}

/// Records held in memory, grouped into pages of roughly `page_size` bytes.
#[derive(Debug, Clone, Default)]
pub struct PagedInput {
    pages: Vec<Vec<Vec<u8>>>,
    page_size: usize,
    page_bytes: usize,
    rows: usize,
}

impl PagedInput {
    pub fn new(page_size: usize) -> Self {
        Self {
            pages: Vec::new(),
            page_size: page_size.max(1),
            page_bytes: 0,
            rows: 0,
        }
    }

    pub fn from_records<I: IntoIterator<Item = Vec<u8>>>(records: I, page_size: usize) -> Self {
        let mut input = Self::new(page_size);
        for record in records {
            input.push(record);
        }
        input
    }

    /// Drains a record source into memory.
    pub fn from_source(source: &mut dyn RecordSource, page_size: usize) -> anyhow::Result<Self> {
        let mut input = Self::new(page_size);
        let mut buffer = vec![0u8; page_size.max(1)];
        loop {
            match source.fetch(&mut buffer)? {
                FetchStatus::Record(len) => input.push(buffer[..len].to_vec()),
                FetchStatus::DoesNotFit(needed) => buffer.resize(needed, 0),
                FetchStatus::Exhausted => return Ok(input),
            }
        }
    }

    pub fn push(&mut self, record: Vec<u8>) {
        let len = record.len();
        let fits = self.page_bytes + len <= self.page_size;
        match self.pages.last_mut() {
            Some(page) if fits => page.push(record),
            _ => {
                self.pages.push(vec![record]);
                self.page_bytes = 0;
            }
        }
        self.page_bytes += len;
        self.rows += 1;
    }
}

impl PartitionedSource for PagedInput {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn row_count(&self) -> usize {
        self.rows
    }

    fn scan(&self, pages: Range<usize>) -> Box<dyn RecordSource + Send + '_> {
        Box::new(PageScan {
            pages: &self.pages[pages],
            page: 0,
            row: 0,
        })
    }
}

struct PageScan<'a> {
    pages: &'a [Vec<Vec<u8>>],
    page: usize,
    row: usize,
}

impl RecordSource for PageScan<'_> {
    fn fetch(&mut self, area: &mut [u8]) -> anyhow::Result<FetchStatus> {
        while self.page < self.pages.len() && self.row >= self.pages[self.page].len() {
            self.page += 1;
            self.row = 0;
        }
        let Some(record) = self.pages.get(self.page).and_then(|page| page.get(self.row)) else {
            return Ok(FetchStatus::Exhausted);
        };
        if record.len() > area.len() {
            return Ok(FetchStatus::DoesNotFit(record.len()));
        }
        area[..record.len()].copy_from_slice(record);
        self.row += 1;
        Ok(FetchStatus::Record(record.len()))
    }
}

/// Contiguous, non-empty page ranges, one per worker. Empty when fewer than
/// two partitions are possible.
pub fn partition_ranges(page_count: usize, row_count: usize, workers: usize) -> Vec<Range<usize>> {
    let partitions = workers.min(page_count).min(row_count);
    if partitions < 2 {
        return Vec::new();
    }
    (0..partitions)
        .map(|i| i * page_count / partitions..(i + 1) * page_count / partitions)
        .collect()
}

/// A finished sort left on disk as one run, with the overflow records it refers to.
pub(crate) struct SortedRun {
    file: TempFile,
    pages: usize,
    overflow: Option<OverflowFile>,
}

/// Sorts the whole source down to a single run and detaches it from the context.
pub(crate) fn sort_to_run(
    ctx: &mut SortContext<'_>,
    source: &mut dyn RecordSource,
) -> Result<Option<SortedRun>> {
    sort_input(ctx, source, None)?;
    if ctx.tot_runs == 0 {
        return Ok(None);
    }
    if ctx.tot_runs > 1 {
        merge_runs(ctx, None)?;
    }

    let index = ctx.in_half;
    let pages = ctx.ledgers[index].first_run_pages().ok_or(SortError::CorruptedLedger {
        file: index,
        reason: "sorted input left no run",
    })?;
    if ctx.ledgers[index].run_count() != 1 {
        return Err(SortError::CorruptedLedger {
            file: index,
            reason: "more than one run after the final pass",
        });
    }
    let file = ctx.files[index].take().ok_or(SortError::CorruptedLedger {
        file: index,
        reason: "final run file missing",
    })?;
    ctx.ledgers[index].clear();

    Ok(Some(SortedRun {
        file,
        pages,
        overflow: ctx.overflow.take(),
    }))
}

struct WorkerRun {
    run: Option<SortedRun>,
    stats: ExternalSortStats,
}

fn run_worker(
    config: &ExternalSortConfig,
    input: &dyn PartitionedSource,
    order: &dyn RecordOrder,
    worker: usize,
    pages: Range<usize>,
) -> Result<WorkerRun> {
    let started = Instant::now();
    let mut source = input.scan(pages.clone());
    let mut ctx = SortContext::new(config, order, Some(pages.len()))?;
    let run = sort_to_run(&mut ctx, &mut *source)?;

    let mut stats = ctx.stats.clone();
    stats.sort_time_ms = started.elapsed().as_millis() as u64;
    debug!(
        worker,
        first_page = pages.start,
        last_page = pages.end,
        records = stats.records_fetched,
        runs = stats.runs_created,
        "sort worker finished"
    );
    Ok(WorkerRun { run, stats })
}

/// Runs one worker per range, then merges their runs into `sink`.
pub(crate) fn sort_fanout(
    config: &ExternalSortConfig,
    input: &dyn PartitionedSource,
    ranges: Vec<Range<usize>>,
    order: &dyn RecordOrder,
    sink: &mut dyn RecordSink,
    stats: &mut ExternalSortStats,
) -> Result<Flow> {
    let started = Instant::now();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(ranges.len())
        .thread_name(|i| format!("pagesort-worker-{i}"))
        .build()
        .map_err(|e| {
            error!("failed to start sort workers: {}", e);
            SortError::Internal("failed to start sort workers")
        })?;

    let workers: Vec<WorkerRun> = pool.install(|| {
        ranges
            .par_iter()
            .enumerate()
            .map(|(worker, pages)| run_worker(config, input, order, worker, pages.clone()))
            .collect::<Result<Vec<_>>>()
    })?;

    stats.workers = workers.len();
    for worker in &workers {
        stats.absorb_worker(&worker.stats);
    }
    stats.sort_time_ms = started.elapsed().as_millis() as u64;

    let runs: Vec<&SortedRun> = workers.iter().filter_map(|worker| worker.run.as_ref()).collect();
    let merge_started = Instant::now();
    let flow = merge_worker_runs(config, &runs, order, sink, stats)?;
    stats.merge_time_ms = merge_started.elapsed().as_millis() as u64;
    Ok(flow)
}

fn merge_worker_runs(
    config: &ExternalSortConfig,
    runs: &[&SortedRun],
    order: &dyn RecordOrder,
    sink: &mut dyn RecordSink,
    stats: &mut ExternalSortStats,
) -> Result<Flow> {
    if runs.is_empty() {
        return Ok(Flow::Continue);
    }

    let page_size = config.page_size;
    let run_pages: usize = runs.iter().map(|run| run.pages).sum();
    let tot_buffers =
        total_buffer_pages(config.effective_buffer_pages(), run_pages).max(2 * runs.len());
    let section_pages = input_section_pages(tot_buffers, runs.len());
    let bytes = section_pages * runs.len() * page_size;

    let mut memory = Vec::new();
    memory
        .try_reserve_exact(bytes)
        .map_err(|_| SortError::OutOfMemory { bytes })?;
    memory.resize(bytes, 0);

    let mut cursors = Vec::with_capacity(runs.len());
    for (worker, (run, section)) in runs
        .iter()
        .zip(memory.chunks_exact_mut(section_pages * page_size))
        .enumerate()
    {
        let overflow = run.overflow.as_ref();
        cursors.push(RunCursor::open(&run.file, worker, overflow, section, 0, run.pages)?);
    }

    let cap = config.limit.unwrap_or(usize::MAX);
    let summary = merge_cursors(&mut cursors, order, config.duplicates, cap, |cursor| {
        sink.consume(cursor.current()).map_err(SortError::Output)
    })?;

    stats.merge_passes += 1;
    stats.records_emitted += summary.emitted;
    stats.duplicates_removed += summary.duplicates;
    stats.pages_read += cursors.iter().map(RunCursor::pages_read).sum::<usize>();
    debug!(runs = runs.len(), emitted = summary.emitted, "merged worker runs");
    Ok(summary.flow)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_ranges_cover_all_pages() {
        let ranges = partition_ranges(10, 100, 4);
        assert_eq!(ranges, vec![0..2, 2..5, 5..7, 7..10]);
        assert!(partition_ranges(1, 100, 4).is_empty());
        assert!(partition_ranges(10, 1, 4).is_empty());
        assert_eq!(partition_ranges(3, 3, 8).len(), 3);
    }

    #[test]
    fn test_paged_input_scan_range() {
        let records: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i; 4]).collect();
        let input = PagedInput::from_records(records, 8);
        assert_eq!(input.page_count(), 5);
        assert_eq!(input.row_count(), 10);

        let mut scan = input.scan(1..3);
        let mut area = [0u8; 2];
        assert_eq!(scan.fetch(&mut area).unwrap(), FetchStatus::DoesNotFit(4));
        let mut area = [0u8; 16];
        let mut seen = Vec::new();
        while let FetchStatus::Record(len) = scan.fetch(&mut area).unwrap() {
            seen.push(area[..len].to_vec());
        }
        assert_eq!(seen, vec![vec![2; 4], vec![3; 4], vec![4; 4], vec![5; 4]]);
    }
}
