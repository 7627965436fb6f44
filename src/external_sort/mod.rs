pub mod callbacks;
pub mod config;
pub mod constants;
pub mod context;
pub mod error;
pub mod fanout;
pub mod flush;
pub mod internal;
pub mod ledger;
pub mod merge;
pub mod overflow;
pub mod page;
pub mod processor;
pub mod record;
pub mod run_sort;
pub mod temp_file;


pub use callbacks::{
    BytewiseOrder, FetchStatus, Flow, IterSource, RecordOrder, RecordSink, RecordSource, VecSink,
};
pub use config::{DuplicatePolicy, ExternalSortConfig};
pub use error::SortError;
pub use fanout::{partition_ranges, PagedInput, PartitionedSource};
pub use processor::ExternalSortProcessor;
pub use record::{LineOrder, LineSink, LineSource};

use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExternalSortStats {
    pub records_fetched: usize,
    pub records_emitted: usize,
    pub duplicates_removed: usize,
    pub runs_created: usize,
    pub merge_passes: usize,
    pub pass_through_copies: usize,
    pub overflow_records: usize,
    pub pages_written: usize,
    pub pages_read: usize,
    pub temp_files_retired: usize,
    pub buffer_pages: usize,
    pub half_files: usize,
    pub workers: usize,
    pub stopped_early: bool,
    pub sort_time_ms: u64,
    pub merge_time_ms: u64,
    pub processing_time_ms: u64,
}

impl ExternalSortStats {
    /// Adds a worker's in-memory and run-reduction counters to the coordinator's.
    pub fn absorb_worker(&mut self, worker: &ExternalSortStats) {
        self.records_fetched += worker.records_fetched;
        self.duplicates_removed += worker.duplicates_removed;
        self.runs_created += worker.runs_created;
        self.merge_passes = self.merge_passes.max(worker.merge_passes);
        self.pass_through_copies += worker.pass_through_copies;
        self.overflow_records += worker.overflow_records;
        self.pages_written += worker.pages_written;
        self.pages_read += worker.pages_read;
        self.temp_files_retired += worker.temp_files_retired;
        self.buffer_pages += worker.buffer_pages;
        self.half_files = self.half_files.max(worker.half_files);
    }
}

/// Sorts newline-delimited records from `input_files` into `output_file`
/// without blocking the async runtime.
pub async fn sort_file(
    input_files: &[PathBuf],
    output_file: &Path,
    config: ExternalSortConfig,
) -> anyhow::Result<ExternalSortStats> {
    let processor = ExternalSortProcessor::new(config)?;
    let inputs = input_files.to_vec();
    let output = output_file.to_path_buf();
    tokio::task::spawn_blocking(move || processor.sort_lines(&inputs, &output)).await?
}
