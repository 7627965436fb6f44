use std::path::PathBuf;
use tracing::{debug, warn};

use crate::external_sort::callbacks::RecordOrder;
use crate::external_sort::config::{DuplicatePolicy, ExternalSortConfig};
use crate::external_sort::constants::*;
use crate::external_sort::error::{Result, SortError};
use crate::external_sort::ledger::RunLedger;
use crate::external_sort::overflow::OverflowFile;
use crate::external_sort::temp_file::{TempFile, TempFileOptions};
use crate::external_sort::ExternalSortStats;

/// Pages the input is expected to occupy, padded for estimate error. Without
/// an estimate the buffer limit stands in for it.
pub(crate) fn expected_input_pages(estimate: Option<usize>, buffer_limit: usize) -> usize {
    match estimate {
        Some(pages) if pages > 0 => {
            let slack =
                ((pages as f64 * ESTIMATE_SLACK_RATIO) as usize).max(MIN_ESTIMATE_SLACK_PAGES);
            pages + slack
        }
        _ => buffer_limit,
    }
}

pub(crate) fn total_buffer_pages(buffer_limit: usize, input_pages: usize) -> usize {
    buffer_limit.min(input_pages).max(MIN_BUFFER_PAGES)
}

/// Number of temp files per half, between the min and max half-file counts.
pub(crate) fn half_file_count(tot_buffers: usize, input_pages: usize) -> usize {
    let mut half = tot_buffers - 1;
    if input_pages > 0 {
        let expected_runs = input_pages.div_ceil(tot_buffers) + 1;
        if expected_runs < half {
            half = expected_runs.max(tot_buffers / 2);
        }
    }
    half.clamp(SORT_MIN_HALF_FILES, SORT_MAX_HALF_FILES)
}

/// Pages given to each input run during a merge; the output gets the rest.
pub(crate) fn input_section_pages(tot_buffers: usize, active_files: usize) -> usize {
    (tot_buffers / (2 * active_files.max(1))).max(1)
}

fn allocate_pages(pages: usize, page_size: usize) -> Option<Vec<u8>> {
    let bytes = pages * page_size;
    let mut memory = Vec::new();
    memory.try_reserve_exact(bytes).ok()?;
    memory.resize(bytes, 0);
    Some(memory)
}

/// State of one sort invocation. Dropping it retires every temp file.
pub struct SortContext<'o> {
    pub(crate) order: &'o dyn RecordOrder,
    pub(crate) policy: DuplicatePolicy,
    pub(crate) limit: Option<usize>,
    pub(crate) page_size: usize,
    pub(crate) tot_buffers: usize,
    pub(crate) memory: Vec<u8>,
    pub(crate) half_files: usize,
    pub(crate) in_half: usize,
    pub(crate) files: Vec<Option<TempFile>>,
    pub(crate) ledgers: Vec<RunLedger>,
    pub(crate) overflow: Option<OverflowFile>,
    pub(crate) tmp_file_pages: usize,
    pub(crate) tot_runs: usize,
    pub(crate) stats: ExternalSortStats,
    temp_directory: PathBuf,
    file_options: TempFileOptions,
}

impl<'o> SortContext<'o> {
    pub fn new(
        config: &ExternalSortConfig,
        order: &'o dyn RecordOrder,
        estimated_pages: Option<usize>,
    ) -> Result<Self> {
        let page_size = config.page_size;
        let buffer_limit = config.effective_buffer_pages();
        let input_pages = expected_input_pages(estimated_pages, buffer_limit);
        let mut tot_buffers = total_buffer_pages(buffer_limit, input_pages);

        let memory = match allocate_pages(tot_buffers, page_size) {
            Some(memory) => memory,
            None if tot_buffers > MIN_BUFFER_PAGES => {
                warn!(
                    requested_pages = tot_buffers,
                    "sort buffer allocation failed, falling back to {} pages", MIN_BUFFER_PAGES
                );
                tot_buffers = MIN_BUFFER_PAGES;
                allocate_pages(tot_buffers, page_size).ok_or(SortError::OutOfMemory {
                    bytes: tot_buffers * page_size,
                })?
            }
            None => {
                return Err(SortError::OutOfMemory {
                    bytes: tot_buffers * page_size,
                })
            }
        };

        let half_files = half_file_count(tot_buffers, input_pages);
        let tmp_file_pages = input_pages.div_ceil(half_files).max(1);
        debug!(tot_buffers, half_files, tmp_file_pages, page_size, "sort context ready");

        let stats = ExternalSortStats {
            buffer_pages: tot_buffers,
            half_files,
            workers: 1,
            ..ExternalSortStats::default()
        };

        Ok(Self {
            order,
            policy: config.duplicates,
            limit: config.limit,
            page_size,
            tot_buffers,
            memory,
            half_files,
            in_half: 0,
            files: (0..2 * half_files).map(|_| None).collect(),
            ledgers: (0..2 * half_files).map(|_| RunLedger::new()).collect(),
            overflow: None,
            tmp_file_pages,
            tot_runs: 0,
            stats,
            temp_directory: config.temp_directory.clone(),
            file_options: TempFileOptions {
                encrypted: config.encrypt_spill_files,
            },
        })
    }

    pub fn out_half(&self) -> usize {
        if self.in_half == 0 {
            self.half_files
        } else {
            0
        }
    }

    /// Leading input files that still hold runs. Runs are dealt round robin,
    /// so the active files always form a prefix of the input half.
    pub fn active_input_files(&self) -> usize {
        self.ledgers[self.in_half..self.in_half + self.half_files]
            .iter()
            .take_while(|ledger| !ledger.is_empty())
            .count()
    }

    pub(crate) fn ensure_file(
        &mut self,
        index: usize,
        estimated_pages: usize,
    ) -> Result<&mut TempFile> {
        if self.files[index].is_none() {
            let file = TempFile::create(
                &self.temp_directory,
                RUN_FILE_PREFIX,
                self.page_size,
                estimated_pages,
                self.file_options,
            )?;
            self.files[index] = Some(file);
        }
        self.files[index]
            .as_mut()
            .ok_or(SortError::Internal("temp file vanished after creation"))
    }

    pub(crate) fn overflow_mut(&mut self) -> Result<&mut OverflowFile> {
        if self.overflow.is_none() {
            self.overflow = Some(OverflowFile::create(
                &self.temp_directory,
                self.page_size,
                self.file_options,
            )?);
        }
        self.overflow
            .as_mut()
            .ok_or(SortError::Internal("overflow file vanished after creation"))
    }

    pub(crate) fn retire_file(&mut self, index: usize) {
        if self.files[index].take().is_some() {
            self.stats.temp_files_retired += 1;
            debug!(file = index, "retired temp file");
        }
        self.ledgers[index].clear();
    }

    /// Average allocated pages over the temp files created so far.
    pub(crate) fn average_file_pages(&self) -> usize {
        let (count, pages) = self
            .files
            .iter()
            .flatten()
            .fold((0, 0), |(count, pages), file| (count + 1, pages + file.allocated_pages()));
        if count == 0 {
            self.tmp_file_pages
        } else {
            (pages / count).max(1)
        }
    }

    /// Creates the output half once more than one run exists.
    pub(crate) fn create_output_files(&mut self) -> Result<()> {
        let estimate = self.average_file_pages();
        let out_half = self.out_half();
        for index in out_half..out_half + self.half_files {
            self.ensure_file(index, estimate)?.ensure_pages(estimate)?;
        }
        Ok(())
    }

    /// Sizes each output file for the pass about to run: input runs are dealt
    /// to output files round robin. Files that will receive nothing are retired.
    pub(crate) fn prepare_output_files(&mut self) -> Result<()> {
        let in_half = self.in_half;
        let out_half = self.out_half();
        let half = self.half_files;

        let runs = self.ledgers[in_half..in_half + half]
            .iter()
            .map(RunLedger::run_count)
            .max()
            .unwrap_or(0);

        let mut needed = vec![0usize; half];
        for run in 0..runs {
            let pages: usize = self.ledgers[in_half..in_half + half]
                .iter()
                .filter_map(|ledger| ledger.live_runs().get(run))
                .sum();
            needed[run % half] += pages;
        }

        for (offset, &pages) in needed.iter().enumerate().rev() {
            let index = out_half + offset;
            if pages > 0 {
                self.ensure_file(index, pages)?.ensure_pages(pages)?;
            } else {
                self.retire_file(index);
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> &ExternalSortStats {
        &self.stats
    }
}

impl Drop for SortContext<'_> {
    fn drop(&mut self) {
        let live = self.files.iter().flatten().count() + usize::from(self.overflow.is_some());
        if live > 0 {
            debug!(files = live, "tearing down sort temp files");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_input_pages_padding() {
        assert_eq!(expected_input_pages(None, 256), 256);
        assert_eq!(expected_input_pages(Some(10), 256), 12);
        assert_eq!(expected_input_pages(Some(100), 256), 110);
    }

    #[test]
    fn test_total_buffers_floor() {
        assert_eq!(total_buffer_pages(256, 12), 12);
        assert_eq!(total_buffer_pages(256, 1), MIN_BUFFER_PAGES);
        assert_eq!(total_buffer_pages(64, 1000), 64);
    }

    #[test]
    fn test_half_file_count_bounds() {
        assert_eq!(half_file_count(4, 4), 2);
        assert_eq!(half_file_count(256, 256), 4);
        assert_eq!(half_file_count(8, 1000), 4);
        assert_eq!(half_file_count(5, 6), 3);
    }

    #[test]
    fn test_input_sections() {
        assert_eq!(input_section_pages(16, 4), 2);
        assert_eq!(input_section_pages(4, 3), 1);
        assert_eq!(input_section_pages(100, 2), 25);
    }
}
