use std::path::Path;

use crate::external_sort::constants::{OVERFLOW_FILE_PREFIX, OVERFLOW_LOCATOR_SIZE};
use crate::external_sort::error::{Result, SortError};
use crate::external_sort::temp_file::{TempFile, TempFileOptions};

/// Address of a record kept in the overflow file. Planted in runs as a
/// `Big` record of [`OVERFLOW_LOCATOR_SIZE`] bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverflowLocator {
    pub first_page: u32,
    pub length: u32,
}

impl OverflowLocator {
    pub fn encode(&self) -> [u8; OVERFLOW_LOCATOR_SIZE] {
        let mut out = [0u8; OVERFLOW_LOCATOR_SIZE];
        out[..4].copy_from_slice(&self.first_page.to_le_bytes());
        out[4..].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != OVERFLOW_LOCATOR_SIZE {
            return None;
        }
        let first_page = u32::from_le_bytes(bytes[..4].try_into().ok()?);
        let length = u32::from_le_bytes(bytes[4..].try_into().ok()?);
        Some(Self { first_page, length })
    }
}

/// Side store for records larger than a page. Each record occupies whole pages.
pub struct OverflowFile {
    file: TempFile,
    next_page: usize,
    records: usize,
}

impl OverflowFile {
    pub fn create(dir: &Path, page_size: usize, options: TempFileOptions) -> Result<Self> {
        let file = TempFile::create(dir, OVERFLOW_FILE_PREFIX, page_size, 0, options)?;
        Ok(Self {
            file,
            next_page: 0,
            records: 0,
        })
    }

    pub fn record_count(&self) -> usize {
        self.records
    }

    pub fn insert(&mut self, record: &[u8]) -> Result<OverflowLocator> {
        let page_size = self.file.page_size();
        let pages = record.len().div_ceil(page_size).max(1);
        let length = u32::try_from(record.len())
            .map_err(|_| SortError::InvalidRecord { len: record.len(), area: u32::MAX as usize })?;
        let first_page = u32::try_from(self.next_page)
            .map_err(|_| SortError::Internal("overflow file exceeds addressable pages"))?;

        let mut padded = Vec::new();
        padded
            .try_reserve_exact(pages * page_size)
            .map_err(|_| SortError::OutOfMemory { bytes: pages * page_size })?;
        padded.extend_from_slice(record);
        padded.resize(pages * page_size, 0);

        self.file.write_pages(self.next_page, &padded)?;
        self.next_page += pages;
        self.records += 1;
        Ok(OverflowLocator { first_page, length })
    }

    /// Materializes the record into `out`, replacing its contents.
    pub fn read(&self, locator: OverflowLocator, out: &mut Vec<u8>) -> Result<()> {
        let page_size = self.file.page_size();
        let length = locator.length as usize;
        let pages = length.div_ceil(page_size).max(1);

        out.clear();
        out.try_reserve(pages * page_size)
            .map_err(|_| SortError::OutOfMemory { bytes: pages * page_size })?;
        out.resize(pages * page_size, 0);
        self.file.read_pages(locator.first_page as usize, out)?;
        out.truncate(length);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_long_records_round_trip() {
        let dir = tempdir().unwrap();
        let mut overflow =
            OverflowFile::create(dir.path(), 512, TempFileOptions::default()).unwrap();

        let first: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        let second = vec![9u8; 513];
        let a = overflow.insert(&first).unwrap();
        let b = overflow.insert(&second).unwrap();
        assert_eq!(a.first_page, 0);
        assert_eq!(b.first_page, 3);
        assert_eq!(overflow.record_count(), 2);

        let mut out = Vec::new();
        overflow.read(b, &mut out).unwrap();
        assert_eq!(out, second);
        overflow.read(a, &mut out).unwrap();
        assert_eq!(out, first);
        assert_eq!(OverflowLocator::decode(&a.encode()), Some(a));
    }
}
