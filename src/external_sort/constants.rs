pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;
pub const DEFAULT_BUFFER_PAGES: usize = 1024;
pub const DEFAULT_MEMORY_USAGE_PERCENT: f64 = 60.0;
pub const DEFAULT_PARALLEL_WORKERS: usize = 4;

pub const MIN_PAGE_SIZE: usize = 512;
pub const MAX_PAGE_SIZE: usize = 32 * 1024;
pub const MIN_BUFFER_PAGES: usize = 4;
pub const MIN_MEMORY_USAGE_PERCENT: f64 = 10.0;
pub const MAX_MEMORY_USAGE_PERCENT: f64 = 90.0;
pub const MIN_PARALLEL_WORKERS: usize = 2;
pub const MAX_PARALLEL_WORKERS: usize = 16;

// Temp files are split in two halves that swap input/output roles each pass.
pub const SORT_MIN_HALF_FILES: usize = 2;
pub const SORT_MAX_HALF_FILES: usize = 4;

pub const LEDGER_INITIAL_RUNS: usize = 30;

// Input estimates are padded by this ratio (at least MIN_ESTIMATE_SLACK_PAGES).
pub const ESTIMATE_SLACK_RATIO: f64 = 0.1;
pub const MIN_ESTIMATE_SLACK_PAGES: usize = 2;

pub const RECORD_ALIGNMENT: usize = 8;
/// Bytes charged against the arena for every buffered record besides its payload.
pub const RECORD_INDEX_OVERHEAD: usize = 16;
/// Smallest fetch area worth offering the input source before declaring the arena full.
pub const MIN_FETCH_AREA: usize = 32;

pub const PAGE_HEADER_SIZE: usize = 8;
pub const PAGE_SLOT_SIZE: usize = 6;
pub const OVERFLOW_LOCATOR_SIZE: usize = 8;

pub const TEMP_DIR_NAME: &str = "pagesort_temp";
pub const RUN_FILE_PREFIX: &str = "sort_run_";
pub const OVERFLOW_FILE_PREFIX: &str = "sort_overflow_";

pub const PROGRESS_REPORT_INTERVAL_RECORDS: usize = 100_000;

pub const DEFAULT_FIELD_SEPARATOR: char = ',';
pub const LINE_READ_BUFFER_SIZE: usize = 64 * 1024;
