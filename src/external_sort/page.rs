//! Slotted page layout used for every run page.
//!
//! A page starts with an 8 byte header (record count, first free byte,
//! alignment) and keeps its slot directory at the tail, growing downwards.
//! Each slot holds the record offset, its length and its kind. Record bytes
//! grow upwards from the header.

use std::ops::Range;

use crate::external_sort::constants::{PAGE_HEADER_SIZE, PAGE_SLOT_SIZE};

const NRECS_AT: usize = 0;
const FREE_AT: usize = 2;
const ALIGN_AT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// An ordinary record stored inline.
    Home,
    /// An indirection to a record kept in the overflow file.
    Big,
}

impl RecordKind {
    fn code(self) -> u16 {
        match self {
            RecordKind::Home => 0,
            RecordKind::Big => 1,
        }
    }

    fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(RecordKind::Home),
            1 => Some(RecordKind::Big),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PageRecord<'a> {
    pub data: &'a [u8],
    pub kind: RecordKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    Copied(usize),
    TooSmall(usize),
}

/// Largest record that fits on an empty page of this size.
pub fn max_record_len(page_size: usize) -> usize {
    page_size - PAGE_HEADER_SIZE - PAGE_SLOT_SIZE
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn write_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn slot_at(page_size: usize, slot: usize) -> usize {
    page_size - (slot + 1) * PAGE_SLOT_SIZE
}

/// Writable view of one page.
pub struct SlottedPage<'a> {
    buf: &'a mut [u8],
}

impl<'a> SlottedPage<'a> {
    pub fn initialize(buf: &'a mut [u8], alignment: usize) -> Self {
        buf[..PAGE_HEADER_SIZE].fill(0);
        write_u16(buf, NRECS_AT, 0);
        write_u16(buf, FREE_AT, PAGE_HEADER_SIZE as u16);
        write_u16(buf, ALIGN_AT, alignment.max(1) as u16);
        Self { buf }
    }

    /// Reopens a page that was already initialized.
    pub fn open(buf: &'a mut [u8]) -> Self {
        Self { buf }
    }

    pub fn record_count(&self) -> usize {
        read_u16(self.buf, NRECS_AT) as usize
    }

    /// Returns the new slot, or `None` when the page has no room left.
    pub fn insert(&mut self, record: &[u8], kind: RecordKind) -> Option<usize> {
        let page_size = self.buf.len();
        let nrecs = self.record_count();
        let alignment = read_u16(self.buf, ALIGN_AT).max(1) as usize;
        let free = read_u16(self.buf, FREE_AT) as usize;

        let offset = free.div_ceil(alignment) * alignment;
        let directory_start = page_size.checked_sub((nrecs + 1) * PAGE_SLOT_SIZE)?;
        if offset + record.len() > directory_start {
            return None;
        }

        self.buf[offset..offset + record.len()].copy_from_slice(record);
        let slot = slot_at(page_size, nrecs);
        write_u16(self.buf, slot, offset as u16);
        write_u16(self.buf, slot + 2, record.len() as u16);
        write_u16(self.buf, slot + 4, kind.code());
        write_u16(self.buf, NRECS_AT, (nrecs + 1) as u16);
        write_u16(self.buf, FREE_AT, (offset + record.len()) as u16);
        Some(nrecs)
    }

    pub fn view(&self) -> PageRef<'_> {
        PageRef { buf: self.buf }
    }
}

/// Read-only view of one page.
#[derive(Clone, Copy)]
pub struct PageRef<'a> {
    buf: &'a [u8],
}

impl<'a> PageRef<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn record_count(&self) -> usize {
        read_u16(self.buf, NRECS_AT) as usize
    }

    /// Byte range and kind of a slot; `None` when the slot does not exist or is inconsistent.
    pub fn slot_span(&self, slot: usize) -> Option<(Range<usize>, RecordKind)> {
        let page_size = self.buf.len();
        let nrecs = self.record_count();
        if slot >= nrecs || PAGE_HEADER_SIZE + nrecs * PAGE_SLOT_SIZE > page_size {
            return None;
        }

        let at = slot_at(page_size, slot);
        let offset = read_u16(self.buf, at) as usize;
        let len = read_u16(self.buf, at + 2) as usize;
        let kind = RecordKind::from_code(read_u16(self.buf, at + 4))?;
        if offset < PAGE_HEADER_SIZE || offset + len > page_size - nrecs * PAGE_SLOT_SIZE {
            return None;
        }
        Some((offset..offset + len, kind))
    }

    pub fn peek(&self, slot: usize) -> Option<PageRecord<'a>> {
        let (range, kind) = self.slot_span(slot)?;
        Some(PageRecord {
            data: &self.buf[range],
            kind,
        })
    }

    pub fn copy_to(&self, slot: usize, out: &mut [u8]) -> Option<CopyOutcome> {
        let record = self.peek(slot)?;
        if record.data.len() > out.len() {
            return Some(CopyOutcome::TooSmall(record.data.len()));
        }
        out[..record.data.len()].copy_from_slice(record.data);
        Some(CopyOutcome::Copied(record.data.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_until_full() {
        let mut buf = vec![0u8; 64];
        let mut page = SlottedPage::initialize(&mut buf, 8);
        assert_eq!(page.insert(b"abc", RecordKind::Home), Some(0));
        assert_eq!(page.insert(b"defgh", RecordKind::Big), Some(1));
        // records end at 21; a third slot leaves 24..46 for data
        assert_eq!(page.insert(&[7u8; 28], RecordKind::Home), None);
        assert_eq!(page.insert(&[7u8; 22], RecordKind::Home), Some(2));
        assert_eq!(page.record_count(), 3);

        let view = page.view();
        let second = view.peek(1).unwrap();
        assert_eq!(second.data, b"defgh");
        assert_eq!(second.kind, RecordKind::Big);
        assert!(view.peek(3).is_none());
    }

    #[test]
    fn test_max_record_fits_empty_page() {
        let mut buf = vec![0u8; 512];
        let record = vec![1u8; max_record_len(512)];
        let mut page = SlottedPage::initialize(&mut buf, 8);
        assert_eq!(page.insert(&record, RecordKind::Home), Some(0));
        assert_eq!(page.insert(b"", RecordKind::Home), None);
    }

    #[test]
    fn test_copy_reports_small_buffer() {
        let mut buf = vec![0u8; 128];
        SlottedPage::initialize(&mut buf, 8).insert(b"hello world", RecordKind::Home);
        let view = PageRef::new(&buf);

        let mut small = [0u8; 4];
        assert_eq!(view.copy_to(0, &mut small), Some(CopyOutcome::TooSmall(11)));
        let mut large = [0u8; 16];
        assert_eq!(view.copy_to(0, &mut large), Some(CopyOutcome::Copied(11)));
        assert_eq!(&large[..11], b"hello world");
    }
}
