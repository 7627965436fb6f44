// Page-oriented external merge sort
pub mod external_sort;

pub mod constants;

// Logging setup and formatting helpers for the CLI
pub mod utils;

pub use external_sort::{
    sort_file, DuplicatePolicy, ExternalSortConfig, ExternalSortProcessor, ExternalSortStats,
    SortError,
};
