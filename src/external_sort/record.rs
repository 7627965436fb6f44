use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use anyhow::Context;
use tracing::debug;

use crate::external_sort::callbacks::{FetchStatus, Flow, RecordOrder, RecordSink, RecordSource};
use crate::external_sort::config::ExternalSortConfig;
use crate::external_sort::constants::LINE_READ_BUFFER_SIZE;

/// Orders text lines, optionally by a single separated field and ignoring ASCII case.
#[derive(Debug, Clone)]
pub struct LineOrder {
    case_sensitive: bool,
    key_field: Option<usize>,
    separator: u8,
}

impl LineOrder {
    pub fn new(case_sensitive: bool, key_field: Option<usize>, separator: char) -> Self {
        let separator = if separator.is_ascii() { separator as u8 } else { b',' };
        Self {
            case_sensitive,
            key_field,
            separator,
        }
    }

    pub fn from_config(config: &ExternalSortConfig) -> Self {
        Self::new(config.case_sensitive, config.key_field, config.field_separator)
    }

    fn key<'a>(&self, line: &'a [u8]) -> &'a [u8] {
        match self.key_field {
            Some(field) => line.split(|&b| b == self.separator).nth(field).unwrap_or(&[]),
            None => line,
        }
    }
}

impl RecordOrder for LineOrder {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let (a, b) = (self.key(a), self.key(b));
        if self.case_sensitive {
            return a.cmp(b);
        }
        a.iter()
            .map(u8::to_ascii_lowercase)
            .cmp(b.iter().map(u8::to_ascii_lowercase))
    }
}

/// Reads lines from a list of files in order. Empty lines are skipped and
/// line terminators are not part of the record.
pub struct LineSource {
    files: Vec<PathBuf>,
    next_file: usize,
    reader: Option<BufReader<File>>,
    line: Vec<u8>,
    pending: bool,
}

impl LineSource {
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self {
            files,
            next_file: 0,
            reader: None,
            line: Vec::new(),
            pending: false,
        }
    }

    /// Loads the next non-empty line into `self.line`; false once every file is done.
    fn read_line(&mut self) -> anyhow::Result<bool> {
        loop {
            let Some(reader) = self.reader.as_mut() else {
                let Some(path) = self.files.get(self.next_file) else {
                    return Ok(false);
                };
                let file = File::open(path)
                    .with_context(|| format!("failed to open {}", path.display()))?;
                debug!("reading records from {}", path.display());
                self.reader = Some(BufReader::with_capacity(LINE_READ_BUFFER_SIZE, file));
                self.next_file += 1;
                continue;
            };

            self.line.clear();
            if reader.read_until(b'\n', &mut self.line)? == 0 {
                self.reader = None;
                continue;
            }
            while matches!(self.line.last(), Some(b'\n' | b'\r')) {
                self.line.pop();
            }
            if !self.line.is_empty() {
                return Ok(true);
            }
        }
    }
}

impl RecordSource for LineSource {
    fn fetch(&mut self, area: &mut [u8]) -> anyhow::Result<FetchStatus> {
        if !self.pending {
            if !self.read_line()? {
                return Ok(FetchStatus::Exhausted);
            }
            self.pending = true;
        }

        let len = self.line.len();
        if len > area.len() {
            return Ok(FetchStatus::DoesNotFit(len));
        }
        area[..len].copy_from_slice(&self.line);
        self.pending = false;
        Ok(FetchStatus::Record(len))
    }
}

/// Writes each record followed by a newline.
pub struct LineSink<W: Write> {
    writer: W,
    written: usize,
}

impl<W: Write> LineSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn into_inner(self) -> anyhow::Result<W> {
        Ok(self.writer)
    }
}

impl<W: Write> RecordSink for LineSink<W> {
    fn consume(&mut self, record: &[u8]) -> anyhow::Result<Flow> {
        self.writer.write_all(record)?;
        self.writer.write_all(b"\n")?;
        self.written += 1;
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_line_order_by_field_ignoring_case() {
        let order = LineOrder::new(false, Some(1), ',');
        assert_eq!(order.compare(b"z,Apple,1", b"a,banana,0"), Ordering::Less);
        assert_eq!(order.compare(b"z,APPLE", b"a,apple"), Ordering::Equal);
        assert_eq!(order.compare(b"nofield", b"x,a"), Ordering::Less);

        let exact = LineOrder::new(true, None, ',');
        assert_eq!(exact.compare(b"B", b"a"), Ordering::Less);
    }

    #[test]
    fn test_line_source_spans_files() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let first = dir.path().join("first.txt");
        let second = dir.path().join("second.txt");
        std::fs::write(&first, "alpha\r\n\nbravo\n")?;
        std::fs::write(&second, "a much longer line\n")?;

        let mut source = LineSource::new(vec![first, second]);
        let mut area = [0u8; 8];
        let mut lines = Vec::new();
        loop {
            match source.fetch(&mut area)? {
                FetchStatus::Record(len) => {
                    lines.push(String::from_utf8_lossy(&area[..len]).into_owned())
                }
                FetchStatus::DoesNotFit(needed) => {
                    assert_eq!(needed, 18);
                    let mut large = vec![0u8; needed];
                    let FetchStatus::Record(len) = source.fetch(&mut large)? else {
                        panic!("pending line was lost");
                    };
                    lines.push(String::from_utf8_lossy(&large[..len]).into_owned());
                }
                FetchStatus::Exhausted => break,
            }
        }
        assert_eq!(lines, vec!["alpha", "bravo", "a much longer line"]);
        Ok(())
    }

    #[test]
    fn test_line_sink_appends_newlines() -> anyhow::Result<()> {
        let mut sink = LineSink::new(Vec::new());
        sink.consume(b"one")?;
        sink.consume(b"two")?;
        assert_eq!(sink.written(), 2);
        assert_eq!(sink.into_inner()?, b"one\ntwo\n");
        Ok(())
    }
}
