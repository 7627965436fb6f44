use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::{Builder, NamedTempFile};
use tracing::debug;

use crate::external_sort::error::{Result, SortError};

/// Options handed through to the spill file. `encrypted` is recorded on the
/// file and reported, the byte layout is unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TempFileOptions {
    pub encrypted: bool,
}

/// A page-addressed spill file. The backing file is removed when dropped.
pub struct TempFile {
    file: NamedTempFile,
    page_size: usize,
    allocated_pages: usize,
    options: TempFileOptions,
}

impl TempFile {
    pub fn create(
        dir: &Path,
        prefix: &str,
        page_size: usize,
        estimated_pages: usize,
        options: TempFileOptions,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(SortError::temp_file("create directory"))?;
        let file = Builder::new()
            .prefix(prefix)
            .tempfile_in(dir)
            .map_err(SortError::temp_file("create"))?;

        debug!(
            path = %file.path().display(),
            estimated_pages,
            encrypted = options.encrypted,
            "created temp file"
        );

        let mut temp = Self {
            file,
            page_size,
            allocated_pages: 0,
            options,
        };
        temp.ensure_pages(estimated_pages)?;
        Ok(temp)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn allocated_pages(&self) -> usize {
        self.allocated_pages
    }

    pub fn options(&self) -> TempFileOptions {
        self.options
    }

    /// Grows the file to hold at least `pages` pages. Never shrinks.
    pub fn ensure_pages(&mut self, pages: usize) -> Result<()> {
        if pages <= self.allocated_pages {
            return Ok(());
        }
        self.file
            .as_file()
            .set_len((pages * self.page_size) as u64)
            .map_err(SortError::temp_file("grow"))?;
        self.allocated_pages = pages;
        Ok(())
    }

    /// Fills `buf` (a whole number of pages) starting at page `first`.
    pub fn read_pages(&self, first: usize, buf: &mut [u8]) -> Result<()> {
        let count = buf.len() / self.page_size;
        if first + count > self.allocated_pages {
            return Err(SortError::TempFile {
                context: "read",
                source: io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "pages {}..{} beyond {} allocated",
                        first,
                        first + count,
                        self.allocated_pages
                    ),
                ),
            });
        }

        let mut file: &File = self.file.as_file();
        file.seek(SeekFrom::Start((first * self.page_size) as u64))
            .map_err(SortError::temp_file("seek"))?;
        file.read_exact(buf).map_err(SortError::temp_file("read"))
    }

    /// Writes `buf` (a whole number of pages) at page `first`, extending the file as needed.
    pub fn write_pages(&mut self, first: usize, buf: &[u8]) -> Result<()> {
        let count = buf.len() / self.page_size;
        let mut file: &File = self.file.as_file();
        file.seek(SeekFrom::Start((first * self.page_size) as u64))
            .map_err(SortError::temp_file("seek"))?;
        file.write_all(buf).map_err(SortError::temp_file("write"))?;
        self.allocated_pages = self.allocated_pages.max(first + count);
        Ok(())
    }
}

impl std::fmt::Debug for TempFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempFile")
            .field("path", &self.file.path())
            .field("allocated_pages", &self.allocated_pages)
            .field("encrypted", &self.options.encrypted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_pages_round_trip_and_grow() {
        let dir = tempdir().unwrap();
        let mut file =
            TempFile::create(dir.path(), "t_", 64, 2, TempFileOptions::default()).unwrap();
        assert_eq!(file.allocated_pages(), 2);

        let pages: Vec<u8> = (0..192).map(|i| i as u8).collect();
        file.write_pages(1, &pages).unwrap();
        assert_eq!(file.allocated_pages(), 4);

        let mut back = vec![0u8; 128];
        file.read_pages(2, &mut back).unwrap();
        assert_eq!(&back[..], &pages[64..]);

        let mut beyond = vec![0u8; 64];
        assert!(file.read_pages(4, &mut beyond).is_err());
    }

    #[test]
    fn test_drop_removes_file() {
        let dir = tempdir().unwrap();
        let options = TempFileOptions { encrypted: true };
        let file = TempFile::create(dir.path(), "t_", 64, 1, options).unwrap();
        assert!(file.options().encrypted);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        drop(file);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
