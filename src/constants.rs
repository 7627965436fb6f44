pub const BYTES_PER_KB: usize = 1024;
pub const BYTES_PER_MB: usize = 1_048_576;
pub const BYTES_PER_GB: f64 = 1_073_741_824.0;
pub const PERCENT_100: f64 = 100.0;

pub const DEFAULT_CONFIG_FILE: &str = "pagesort_config.json";
pub const LOG_TARGET: &str = "pagesort";
