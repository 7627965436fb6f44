use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use anyhow::Result;
use crate::constants::{BYTES_PER_KB, PERCENT_100};
use crate::external_sort::constants::*;

/// How records that compare equal are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    #[default]
    KeepAll,
    Eliminate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalSortConfig {
    pub page_size: usize,
    pub buffer_pages: usize,
    pub memory_usage_percent: f64,
    pub estimated_input_pages: Option<usize>,
    pub duplicates: DuplicatePolicy,
    pub limit: Option<usize>,
    pub parallel: bool,
    pub parallel_workers: usize,
    pub encrypt_spill_files: bool,
    pub temp_directory: PathBuf,
    pub case_sensitive: bool,
    pub key_field: Option<usize>,
    pub field_separator: char,
    pub verbose: bool,
}

impl Default for ExternalSortConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            buffer_pages: DEFAULT_BUFFER_PAGES,
            memory_usage_percent: DEFAULT_MEMORY_USAGE_PERCENT,
            estimated_input_pages: None,
            duplicates: DuplicatePolicy::KeepAll,
            limit: None,
            parallel: false,
            parallel_workers: DEFAULT_PARALLEL_WORKERS,
            encrypt_spill_files: false,
            temp_directory: std::env::temp_dir().join(TEMP_DIR_NAME),
            case_sensitive: true,
            key_field: None,
            field_separator: DEFAULT_FIELD_SEPARATOR,
            verbose: false,
        }
    }
}

impl ExternalSortConfig {
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: &std::path::Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size < MIN_PAGE_SIZE || self.page_size > MAX_PAGE_SIZE {
            return Err(anyhow::anyhow!(
                "Page size must be between {} and {} bytes",
                MIN_PAGE_SIZE, MAX_PAGE_SIZE
            ));
        }

        if self.page_size % RECORD_ALIGNMENT != 0 {
            return Err(anyhow::anyhow!(
                "Page size must be a multiple of {}", RECORD_ALIGNMENT
            ));
        }

        if self.buffer_pages < MIN_BUFFER_PAGES {
            return Err(anyhow::anyhow!(
                "Buffer pages must be at least {}", MIN_BUFFER_PAGES
            ));
        }

        if self.memory_usage_percent < MIN_MEMORY_USAGE_PERCENT
            || self.memory_usage_percent > MAX_MEMORY_USAGE_PERCENT {
            return Err(anyhow::anyhow!(
                "Memory usage percent must be between {} and {}",
                MIN_MEMORY_USAGE_PERCENT, MAX_MEMORY_USAGE_PERCENT
            ));
        }

        if self.limit == Some(0) {
            return Err(anyhow::anyhow!("Limit must be a positive record count"));
        }

        if self.parallel_workers < MIN_PARALLEL_WORKERS
            || self.parallel_workers > MAX_PARALLEL_WORKERS {
            return Err(anyhow::anyhow!(
                "Parallel workers must be between {} and {}",
                MIN_PARALLEL_WORKERS, MAX_PARALLEL_WORKERS
            ));
        }

        Ok(())
    }

    pub fn memory_limit_bytes(&self) -> usize {
        use sysinfo::System;
        let mut system = System::new();
        system.refresh_memory();

        let available = system.available_memory() as f64;
        (available * self.memory_usage_percent / PERCENT_100) as usize
    }

    /// Configured page-buffer limit, capped by what the host can actually spare.
    pub fn effective_buffer_pages(&self) -> usize {
        let memory_pages = self.memory_limit_bytes() / self.page_size;
        if memory_pages == 0 {
            // sysinfo reports nothing on some sandboxes; trust the configuration
            return self.buffer_pages;
        }
        self.buffer_pages.min(memory_pages).max(MIN_BUFFER_PAGES)
    }

    pub fn buffer_bytes(&self) -> usize {
        self.effective_buffer_pages() * self.page_size
    }

    pub fn page_size_kb(&self) -> f64 {
        self.page_size as f64 / BYTES_PER_KB as f64
    }
}
