use crate::external_sort::constants::RECORD_ALIGNMENT;
use crate::external_sort::error::{Result, SortError};
use crate::external_sort::page::{RecordKind, SlottedPage};
use crate::external_sort::temp_file::TempFile;

/// Appends one run to a temp file through a section of working memory.
///
/// Records are packed into slotted pages; the section is written out whenever
/// all of its pages are full, and once more by [`RunWriter::finish`].
pub(crate) struct RunWriter<'a> {
    file: &'a mut TempFile,
    section: &'a mut [u8],
    page_size: usize,
    start_page: usize,
    next_file_page: usize,
    filled: usize,
    current_used: bool,
    records: usize,
}

impl<'a> RunWriter<'a> {
    pub fn new(
        file: &'a mut TempFile,
        section: &'a mut [u8],
        page_size: usize,
        start_page: usize,
    ) -> Self {
        SlottedPage::initialize(&mut section[..page_size], RECORD_ALIGNMENT);
        Self {
            file,
            section,
            page_size,
            start_page,
            next_file_page: start_page,
            filled: 0,
            current_used: false,
            records: 0,
        }
    }

    pub fn records(&self) -> usize {
        self.records
    }

    pub fn push(&mut self, record: &[u8], kind: RecordKind) -> Result<()> {
        if self.current_page().insert(record, kind).is_some() {
            self.current_used = true;
            self.records += 1;
            return Ok(());
        }

        self.filled += 1;
        if self.filled * self.page_size == self.section.len() {
            self.write_section()?;
        }
        let at = self.filled * self.page_size;
        SlottedPage::initialize(&mut self.section[at..at + self.page_size], RECORD_ALIGNMENT);

        if self.current_page().insert(record, kind).is_none() {
            return Err(SortError::Internal("record does not fit an empty page"));
        }
        self.current_used = true;
        self.records += 1;
        Ok(())
    }

    /// Writes the remaining pages. Returns the run length in pages and the
    /// first free page after it.
    pub fn finish(mut self) -> Result<(usize, usize)> {
        if self.current_used {
            self.filled += 1;
        }
        self.write_section()?;
        Ok((self.next_file_page - self.start_page, self.next_file_page))
    }

    fn current_page(&mut self) -> SlottedPage<'_> {
        let at = self.filled * self.page_size;
        SlottedPage::open(&mut self.section[at..at + self.page_size])
    }

    fn write_section(&mut self) -> Result<()> {
        if self.filled > 0 {
            let bytes = self.filled * self.page_size;
            self.file.write_pages(self.next_file_page, &self.section[..bytes])?;
            self.next_file_page += self.filled;
            self.filled = 0;
        }
        self.current_used = false;
        Ok(())
    }
}
