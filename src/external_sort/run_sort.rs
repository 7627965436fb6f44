//! In-memory sorting of the records buffered between two flushes.
//!
//! Records live in a [`SortArena`]; the sort itself works on a vector of
//! record ids. Natural ascending or descending runs are detected in input
//! order and pushed on a stack of [`RunDescriptor`]s; the two topmost runs
//! are merged whenever their depths match, which keeps merges balanced.
//! Equal records are either chained behind the earliest one or dropped.

use std::cmp::Ordering;

use crate::external_sort::callbacks::RecordOrder;
use crate::external_sort::config::DuplicatePolicy;
use crate::external_sort::constants::{
    PAGE_HEADER_SIZE, PAGE_SLOT_SIZE, RECORD_ALIGNMENT, RECORD_INDEX_OVERHEAD,
};
use crate::external_sort::error::{Result, SortError};

const REMOVED: u32 = u32::MAX;
const NO_DUPLICATE: u32 = u32::MAX;

fn align_up(offset: usize) -> usize {
    offset.div_ceil(RECORD_ALIGNMENT) * RECORD_ALIGNMENT
}

#[derive(Debug, Clone, Copy)]
struct RecordEntry {
    offset: u32,
    len: u32,
    next_duplicate: u32,
    last_duplicate: u32,
}

/// Records fetched since the last flush, packed into a slice of working memory.
pub(crate) struct SortArena<'m> {
    data: &'m mut [u8],
    used: usize,
    entries: Vec<RecordEntry>,
    max_record_len: usize,
}

impl<'m> SortArena<'m> {
    pub fn new(data: &'m mut [u8], max_record_len: usize) -> Self {
        Self {
            data,
            used: 0,
            entries: Vec::new(),
            max_record_len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Space offered to the input source for the next record. Leaves room for
    /// the index overhead of every buffered record plus the new one.
    pub fn fetch_area(&mut self) -> &mut [u8] {
        let start = align_up(self.used).min(self.data.len());
        let reserve = (self.entries.len() + 1) * RECORD_INDEX_OVERHEAD;
        let end = self
            .data
            .len()
            .saturating_sub(reserve)
            .max(start)
            .min(start + self.max_record_len);
        &mut self.data[start..end]
    }

    /// Accepts the record the source just wrote into the fetch area.
    pub fn commit(&mut self, len: usize) -> Result<u32> {
        let offset = align_up(self.used);
        self.entries
            .try_reserve(1)
            .map_err(|_| SortError::OutOfMemory { bytes: std::mem::size_of::<RecordEntry>() })?;
        let id = self.entries.len() as u32;
        self.entries.push(RecordEntry {
            offset: offset as u32,
            len: len as u32,
            next_duplicate: NO_DUPLICATE,
            last_duplicate: id,
        });
        self.used = offset + len;
        Ok(id)
    }

    pub fn payload(&self, id: u32) -> &[u8] {
        let entry = self.entries[id as usize];
        let start = entry.offset as usize;
        &self.data[start..start + entry.len as usize]
    }

    /// The record and every duplicate chained behind it, in input order.
    pub fn chain(&self, head: u32) -> DuplicateChain<'_, 'm> {
        DuplicateChain {
            arena: self,
            next: head,
        }
    }

    pub fn reset(&mut self) {
        self.used = 0;
        self.entries.clear();
    }

    pub fn sorter<'s>(
        &'s mut self,
        order: &'s dyn RecordOrder,
        policy: DuplicatePolicy,
    ) -> NaturalMergeSort<'s> {
        NaturalMergeSort {
            data: &*self.data,
            entries: &mut self.entries,
            order,
            policy,
            eliminated: 0,
        }
    }

    /// Whether the sorted survivors fit on less than one page and, once packed,
    /// leave room for a record of `needed` bytes.
    pub fn can_retain(&self, keys: &[u32], needed: usize, page_size: usize) -> bool {
        let payload: usize = keys
            .iter()
            .map(|&id| align_up(self.entries[id as usize].len as usize))
            .sum();
        if PAGE_HEADER_SIZE + payload + keys.len() * PAGE_SLOT_SIZE >= page_size {
            return false;
        }
        let reserve = (keys.len() + 1) * RECORD_INDEX_OVERHEAD;
        self.data.len().saturating_sub(payload + reserve) >= needed
    }

    /// Repacks the sorted survivors at the front of the arena; `keys` becomes `0..n`.
    pub fn retain_sorted(&mut self, keys: &mut Vec<u32>) -> Result<()> {
        let mut packed: Vec<u8> = Vec::new();
        let mut entries = Vec::new();
        entries
            .try_reserve(keys.len())
            .map_err(|_| SortError::OutOfMemory {
                bytes: keys.len() * std::mem::size_of::<RecordEntry>(),
            })?;

        for (new_id, &id) in keys.iter().enumerate() {
            let offset = align_up(packed.len());
            packed.resize(offset, 0);
            packed.extend_from_slice(self.payload(id));
            entries.push(RecordEntry {
                offset: offset as u32,
                len: self.entries[id as usize].len,
                next_duplicate: NO_DUPLICATE,
                last_duplicate: new_id as u32,
            });
        }

        self.data[..packed.len()].copy_from_slice(&packed);
        self.used = packed.len();
        self.entries = entries;
        keys.clear();
        keys.extend(0..self.entries.len() as u32);
        Ok(())
    }
}

pub(crate) struct DuplicateChain<'a, 'm> {
    arena: &'a SortArena<'m>,
    next: u32,
}

impl<'a, 'm> Iterator for DuplicateChain<'a, 'm> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == NO_DUPLICATE {
            return None;
        }
        let current = self.next;
        self.next = self.arena.entries[current as usize].next_duplicate;
        Some(self.arena.payload(current))
    }
}

#[derive(Debug, Clone, Copy)]
struct RunDescriptor {
    start: usize,
    end: usize,
    depth: u32,
}

impl RunDescriptor {
    fn len(&self) -> usize {
        self.end - self.start
    }
}

pub(crate) struct NaturalMergeSort<'a> {
    data: &'a [u8],
    entries: &'a mut Vec<RecordEntry>,
    order: &'a dyn RecordOrder,
    policy: DuplicatePolicy,
    eliminated: usize,
}

impl<'a> NaturalMergeSort<'a> {
    /// Records dropped as duplicates so far.
    pub fn eliminated(&self) -> usize {
        self.eliminated
    }

    /// Sorts `keys` in place, leaving only survivors. `keys[..sorted_prefix]`
    /// must already be sorted, duplicate free, and earlier in input order.
    pub fn sort(&mut self, keys: &mut Vec<u32>, scratch: &mut Vec<u32>, sorted_prefix: usize) {
        let limit = keys.len();
        let mut stack: Vec<RunDescriptor> = Vec::with_capacity(64);
        if sorted_prefix > 0 {
            stack.push(RunDescriptor {
                start: 0,
                end: sorted_prefix,
                depth: u32::MAX,
            });
        }

        let mut top = sorted_prefix;
        while top < limit {
            let run = self.find_run(keys, top, limit);
            top = run.end;
            stack.push(run);

            let exhausted = top >= limit;
            while stack.len() >= 2 {
                let n = stack.len();
                let (left, right) = (stack[n - 2], stack[n - 1]);
                if !exhausted && left.depth != right.depth {
                    break;
                }
                stack.truncate(n - 2);
                stack.push(self.merge_runs(keys, scratch, left, right));
            }
        }

        let start = stack.first().map_or(0, |run| run.start);
        keys.drain(..start);
    }

    fn payload(&self, id: u32) -> &[u8] {
        let entry = self.entries[id as usize];
        let start = entry.offset as usize;
        &self.data[start..start + entry.len as usize]
    }

    fn compare(&self, a: u32, b: u32) -> Ordering {
        self.order.compare(self.payload(a), self.payload(b))
    }

    /// `duplicate` compared equal to the earlier `survivor`.
    fn absorb(&mut self, survivor: u32, duplicate: u32) {
        match self.policy {
            DuplicatePolicy::KeepAll => {
                let tail = self.entries[survivor as usize].last_duplicate;
                self.entries[tail as usize].next_duplicate = duplicate;
                self.entries[survivor as usize].last_duplicate =
                    self.entries[duplicate as usize].last_duplicate;
            }
            DuplicatePolicy::Eliminate => self.eliminated += 1,
        }
    }

    /// Finds the natural run starting at `start`. Absorbed duplicates are
    /// squeezed out so the returned run is contiguous and ends at the scan end.
    fn find_run(&mut self, keys: &mut [u32], start: usize, limit: usize) -> RunDescriptor {
        if start + 1 >= limit {
            return RunDescriptor {
                start,
                end: limit,
                depth: 1,
            };
        }

        let descending = self.compare(keys[start], keys[start + 1]) == Ordering::Greater;
        let mut survivor = start;
        let mut dups = 0;
        let mut last = start;

        while last + 1 < limit {
            let next = last + 1;
            match (descending, self.compare(keys[survivor], keys[next])) {
                (false, Ordering::Less) | (true, Ordering::Greater) => survivor = next,
                (_, Ordering::Equal) => {
                    self.absorb(keys[survivor], keys[next]);
                    keys[next] = REMOVED;
                    dups += 1;
                }
                _ => break,
            }
            last = next;
        }

        let end = last + 1;
        if dups > 0 {
            let mut write = end;
            for read in (start..end).rev() {
                if keys[read] != REMOVED {
                    write -= 1;
                    keys[write] = keys[read];
                }
            }
        }
        if descending {
            keys[start + dups..end].reverse();
        }

        RunDescriptor {
            start: start + dups,
            end,
            depth: 1,
        }
    }

    /// Merges two adjacent runs; the result ends where `right` ended.
    fn merge_runs(
        &mut self,
        keys: &mut [u32],
        scratch: &mut Vec<u32>,
        left: RunDescriptor,
        right: RunDescriptor,
    ) -> RunDescriptor {
        let depth = left.depth.saturating_add(1);

        if self.compare(keys[left.end - 1], keys[right.start]) == Ordering::Less {
            let start = right.start - left.len();
            keys.copy_within(left.start..left.end, start);
            return RunDescriptor {
                start,
                end: right.end,
                depth,
            };
        }

        scratch.clear();
        let (mut i, mut j) = (left.start, right.start);
        while i < left.end && j < right.end {
            match self.compare(keys[i], keys[j]) {
                Ordering::Less => {
                    scratch.push(keys[i]);
                    i += 1;
                }
                Ordering::Greater => {
                    scratch.push(keys[j]);
                    j += 1;
                }
                Ordering::Equal => {
                    self.absorb(keys[i], keys[j]);
                    scratch.push(keys[i]);
                    i += 1;
                    j += 1;
                }
            }
        }
        scratch.extend_from_slice(&keys[i..left.end]);
        scratch.extend_from_slice(&keys[j..right.end]);

        let start = right.end - scratch.len();
        keys[start..right.end].copy_from_slice(&scratch[..]);
        RunDescriptor {
            start,
            end: right.end,
            depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external_sort::callbacks::BytewiseOrder;

    fn load(arena: &mut SortArena<'_>, records: &[&[u8]]) -> Vec<u32> {
        records
            .iter()
            .map(|record| {
                let area = arena.fetch_area();
                area[..record.len()].copy_from_slice(record);
                arena.commit(record.len()).unwrap()
            })
            .collect()
    }

    fn flatten(arena: &SortArena<'_>, keys: &[u32]) -> Vec<Vec<u8>> {
        keys.iter()
            .flat_map(|&key| arena.chain(key).map(|r| r.to_vec()))
            .collect()
    }

    #[test]
    fn test_mixed_runs_sorted() {
        let mut memory = vec![0u8; 4096];
        let mut arena = SortArena::new(&mut memory, 1000);
        let input: Vec<&[u8]> = vec![
            b"d", b"e", b"f", b"c", b"b", b"a", b"g", b"h", b"a2", b"z", b"y",
        ];
        let mut keys = load(&mut arena, &input);
        let mut scratch = Vec::new();

        arena
            .sorter(&BytewiseOrder, DuplicatePolicy::KeepAll)
            .sort(&mut keys, &mut scratch, 0);

        let mut expected: Vec<Vec<u8>> = input.iter().map(|r| r.to_vec()).collect();
        expected.sort();
        assert_eq!(flatten(&arena, &keys), expected);
    }

    #[test]
    fn test_keep_all_chains_in_input_order() {
        let mut memory = vec![0u8; 4096];
        let mut arena = SortArena::new(&mut memory, 1000);
        // equal keys on the first byte only, suffix shows input order
        let input: Vec<&[u8]> = vec![b"b1", b"a1", b"b2", b"a2", b"a3", b"c1", b"b3"];
        let mut keys = load(&mut arena, &input);
        let mut scratch = Vec::new();
        let first_byte = |a: &[u8], b: &[u8]| a[0].cmp(&b[0]);

        arena
            .sorter(&first_byte, DuplicatePolicy::KeepAll)
            .sort(&mut keys, &mut scratch, 0);

        assert_eq!(keys.len(), 3);
        let expected: Vec<Vec<u8>> = [b"a1", b"a2", b"a3", b"b1", b"b2", b"b3", b"c1"]
            .iter()
            .map(|r| r.to_vec())
            .collect();
        assert_eq!(flatten(&arena, &keys), expected);
    }

    #[test]
    fn test_eliminate_keeps_first_occurrence() {
        let mut memory = vec![0u8; 4096];
        let mut arena = SortArena::new(&mut memory, 1000);
        let input: Vec<&[u8]> = vec![b"c1", b"c2", b"b1", b"a1", b"b2", b"a2", b"c3"];
        let mut keys = load(&mut arena, &input);
        let mut scratch = Vec::new();
        let first_byte = |a: &[u8], b: &[u8]| a[0].cmp(&b[0]);

        let mut sorter = arena.sorter(&first_byte, DuplicatePolicy::Eliminate);
        sorter.sort(&mut keys, &mut scratch, 0);
        assert_eq!(sorter.eliminated(), 4);

        let expected: Vec<Vec<u8>> = [b"a1", b"b1", b"c1"].iter().map(|r| r.to_vec()).collect();
        assert_eq!(flatten(&arena, &keys), expected);
    }

    #[test]
    fn test_sorted_prefix_is_merged_as_earliest() {
        let mut memory = vec![0u8; 4096];
        let mut arena = SortArena::new(&mut memory, 1000);
        let mut keys = load(&mut arena, &[b"b1", b"d1"]);
        let mut scratch = Vec::new();
        let first_byte = |a: &[u8], b: &[u8]| a[0].cmp(&b[0]);

        arena.retain_sorted(&mut keys).unwrap();
        let more = load(&mut arena, &[b"d2", b"a1", b"b2"]);
        keys.extend(more);

        arena
            .sorter(&first_byte, DuplicatePolicy::Eliminate)
            .sort(&mut keys, &mut scratch, 2);

        let expected: Vec<Vec<u8>> = [b"a1", b"b1", b"d1"].iter().map(|r| r.to_vec()).collect();
        assert_eq!(flatten(&arena, &keys), expected);
    }

    #[test]
    fn test_fetch_area_shrinks_to_budget() {
        let mut memory = vec![0u8; 256];
        let mut arena = SortArena::new(&mut memory, 100);
        assert_eq!(arena.fetch_area().len(), 100);

        load(&mut arena, &[&[1u8; 100], &[2u8; 100]]);
        // 208 bytes used (aligned), 3 * 16 reserved for the index
        assert_eq!(arena.fetch_area().len(), 0);
    }
}
