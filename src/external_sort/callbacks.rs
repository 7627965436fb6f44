//! Capabilities the engine consumes: a record producer, a record consumer and a
//! total order over records. Records are opaque byte strings.

use std::cmp::Ordering;

/// Result of asking a [`RecordSource`] for its next record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// The record was copied into the first `len` bytes of the area.
    Record(usize),
    /// The next record needs this many bytes. It must be offered again on the next call.
    DoesNotFit(usize),
    Exhausted,
}

/// Whether the engine should keep delivering records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

pub trait RecordSource {
    /// Never called again after `Exhausted` or an error.
    fn fetch(&mut self, area: &mut [u8]) -> anyhow::Result<FetchStatus>;
}

pub trait RecordSink {
    fn consume(&mut self, record: &[u8]) -> anyhow::Result<Flow>;
}

/// Total order used by every comparison of the sort. Must be pure; it is
/// shared with fan-out workers.
pub trait RecordOrder: Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

impl<F> RecordOrder for F
where
    F: Fn(&[u8], &[u8]) -> Ordering + Sync,
{
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self(a, b)
    }
}

/// Plain byte-lexicographic order.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytewiseOrder;

impl RecordOrder for BytewiseOrder {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

impl<S: RecordSource + ?Sized> RecordSource for &mut S {
    fn fetch(&mut self, area: &mut [u8]) -> anyhow::Result<FetchStatus> {
        (**self).fetch(area)
    }
}

impl<S: RecordSource + ?Sized> RecordSource for Box<S> {
    fn fetch(&mut self, area: &mut [u8]) -> anyhow::Result<FetchStatus> {
        (**self).fetch(area)
    }
}

impl<K: RecordSink + ?Sized> RecordSink for &mut K {
    fn consume(&mut self, record: &[u8]) -> anyhow::Result<Flow> {
        (**self).consume(record)
    }
}

/// Feeds records from any iterator of owned byte strings.
pub struct IterSource<I: Iterator<Item = Vec<u8>>> {
    records: I,
    pending: Option<Vec<u8>>,
}

impl<I: Iterator<Item = Vec<u8>>> IterSource<I> {
    pub fn new<T: IntoIterator<IntoIter = I>>(records: T) -> Self {
        Self {
            records: records.into_iter(),
            pending: None,
        }
    }
}

impl<I: Iterator<Item = Vec<u8>>> RecordSource for IterSource<I> {
    fn fetch(&mut self, area: &mut [u8]) -> anyhow::Result<FetchStatus> {
        let record = match self.pending.take().or_else(|| self.records.next()) {
            Some(record) => record,
            None => return Ok(FetchStatus::Exhausted),
        };

        if record.len() > area.len() {
            let needed = record.len();
            self.pending = Some(record);
            return Ok(FetchStatus::DoesNotFit(needed));
        }

        area[..record.len()].copy_from_slice(&record);
        Ok(FetchStatus::Record(record.len()))
    }
}

/// Collects every delivered record.
#[derive(Debug, Default)]
pub struct VecSink {
    pub records: Vec<Vec<u8>>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_records(self) -> Vec<Vec<u8>> {
        self.records
    }
}

impl RecordSink for VecSink {
    fn consume(&mut self, record: &[u8]) -> anyhow::Result<Flow> {
        self.records.push(record.to_vec());
        Ok(Flow::Continue)
    }
}

/// Adapts a closure into a sink.
pub struct FnSink<F>(pub F);

impl<F> RecordSink for FnSink<F>
where
    F: FnMut(&[u8]) -> anyhow::Result<Flow>,
{
    fn consume(&mut self, record: &[u8]) -> anyhow::Result<Flow> {
        (self.0)(record)
    }
}
