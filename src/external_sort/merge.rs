//! External merge stage.
//!
//! Each pass merges the i-th run of every input-half file into one run of
//! the output half, dealing output runs round robin, then swaps the halves.
//! The pass that produces a single run streams it to the sink instead.

use std::cmp::Ordering;
use tracing::{debug, error};

use crate::external_sort::callbacks::{Flow, RecordOrder, RecordSink};
use crate::external_sort::config::DuplicatePolicy;
use crate::external_sort::context::{input_section_pages, SortContext};
use crate::external_sort::error::{Result, SortError};
use crate::external_sort::flush::RunWriter;
use crate::external_sort::ledger::RunLedger;
use crate::external_sort::overflow::{OverflowFile, OverflowLocator};
use crate::external_sort::page::{PageRecord, PageRef, RecordKind};
use crate::external_sort::temp_file::TempFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Advance {
    SamePage,
    NewPage,
    Exhausted,
}

/// Read position inside one on-disk run, buffered through a section of working memory.
pub(crate) struct RunCursor<'a> {
    file: &'a TempFile,
    file_index: usize,
    overflow: Option<&'a OverflowFile>,
    section: &'a mut [u8],
    page_size: usize,
    next_file_page: usize,
    remaining_pages: usize,
    loaded_pages: usize,
    page: usize,
    slot: usize,
    slots_on_page: usize,
    span: (usize, usize),
    kind: RecordKind,
    long_record: Vec<u8>,
    pages_read: usize,
}

impl<'a> RunCursor<'a> {
    pub fn open(
        file: &'a TempFile,
        file_index: usize,
        overflow: Option<&'a OverflowFile>,
        section: &'a mut [u8],
        start_page: usize,
        run_pages: usize,
    ) -> Result<Self> {
        let page_size = file.page_size();
        let mut cursor = Self {
            file,
            file_index,
            overflow,
            section,
            page_size,
            next_file_page: start_page,
            remaining_pages: run_pages,
            loaded_pages: 0,
            page: 0,
            slot: 0,
            slots_on_page: 0,
            span: (0, 0),
            kind: RecordKind::Home,
            long_record: Vec::new(),
            pages_read: 0,
        };
        cursor.load_section()?;
        Ok(cursor)
    }

    /// The current record as compared and delivered, overflow records materialized.
    pub fn current(&self) -> &[u8] {
        match self.kind {
            RecordKind::Big => &self.long_record,
            RecordKind::Home => &self.section[self.span.0..self.span.1],
        }
    }

    /// The current record as stored on its page.
    pub fn raw(&self) -> PageRecord<'_> {
        PageRecord {
            data: &self.section[self.span.0..self.span.1],
            kind: self.kind,
        }
    }

    pub fn at_page_start(&self) -> bool {
        self.slot == 0
    }

    /// First file page after this run.
    pub fn end_page(&self) -> usize {
        self.next_file_page + self.remaining_pages
    }

    pub fn file_index(&self) -> usize {
        self.file_index
    }

    pub fn pages_read(&self) -> usize {
        self.pages_read
    }

    pub fn advance(&mut self) -> Result<Advance> {
        if self.slot + 1 < self.slots_on_page {
            self.slot += 1;
            self.load_record()?;
            return Ok(Advance::SamePage);
        }
        if self.page + 1 < self.loaded_pages {
            self.enter_page(self.page + 1)?;
            return Ok(Advance::NewPage);
        }
        if self.remaining_pages > 0 {
            self.load_section()?;
            return Ok(Advance::NewPage);
        }
        Ok(Advance::Exhausted)
    }

    /// Last record of the current page, materialized into `scratch` if it is an overflow record.
    pub fn last_on_page<'s>(&'s self, scratch: &'s mut Vec<u8>) -> Result<&'s [u8]> {
        let base = self.page * self.page_size;
        let page = PageRef::new(&self.section[base..base + self.page_size]);
        let (range, kind) = page
            .slot_span(self.slots_on_page - 1)
            .ok_or_else(|| self.corrupted("bad slot"))?;
        let stored = &self.section[base + range.start..base + range.end];
        match kind {
            RecordKind::Home => Ok(stored),
            RecordKind::Big => {
                self.read_overflow(stored, scratch)?;
                Ok(&scratch[..])
            }
        }
    }

    fn corrupted(&self, reason: &'static str) -> SortError {
        let page = self.next_file_page - self.loaded_pages + self.page;
        error!(file = self.file_index, page, slot = self.slot, reason, "corrupted run page");
        SortError::CorruptedPage {
            file: self.file_index,
            page,
            reason,
        }
    }

    fn load_section(&mut self) -> Result<()> {
        let section_pages = self.section.len() / self.page_size;
        let count = section_pages.min(self.remaining_pages);
        if count == 0 {
            return Err(SortError::CorruptedLedger {
                file: self.file_index,
                reason: "run without pages",
            });
        }

        self.file
            .read_pages(self.next_file_page, &mut self.section[..count * self.page_size])?;
        self.next_file_page += count;
        self.remaining_pages -= count;
        self.loaded_pages = count;
        self.pages_read += count;
        self.enter_page(0)
    }

    fn enter_page(&mut self, page: usize) -> Result<()> {
        self.page = page;
        self.slot = 0;
        let base = page * self.page_size;
        self.slots_on_page =
            PageRef::new(&self.section[base..base + self.page_size]).record_count();
        if self.slots_on_page == 0 {
            return Err(self.corrupted("empty run page"));
        }
        self.load_record()
    }

    fn load_record(&mut self) -> Result<()> {
        let base = self.page * self.page_size;
        let (range, kind) = PageRef::new(&self.section[base..base + self.page_size])
            .slot_span(self.slot)
            .ok_or_else(|| self.corrupted("bad slot"))?;
        self.span = (base + range.start, base + range.end);
        self.kind = kind;

        if kind == RecordKind::Big {
            let mut long_record = std::mem::take(&mut self.long_record);
            let stored = &self.section[self.span.0..self.span.1];
            let read = self.read_overflow(stored, &mut long_record);
            self.long_record = long_record;
            read?;
        }
        Ok(())
    }

    fn read_overflow(&self, stored: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let locator = OverflowLocator::decode(stored)
            .ok_or_else(|| self.corrupted("bad overflow locator"))?;
        let overflow = self
            .overflow
            .ok_or_else(|| self.corrupted("overflow record without overflow file"))?;
        overflow.read(locator, out)
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    cursor: usize,
    duplicate: bool,
}

/// Outcome of merging one group of runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MergeSummary {
    pub flow: Flow,
    pub emitted: usize,
    pub duplicates: usize,
}

/// Equal records are ordered by cursor index, which follows input order.
fn precedes(cursors: &[RunCursor<'_>], order: &dyn RecordOrder, a: usize, b: usize) -> bool {
    match order.compare(cursors[a].current(), cursors[b].current()) {
        Ordering::Less => true,
        Ordering::Greater => false,
        Ordering::Equal => a < b,
    }
}

fn same_key(cursors: &[RunCursor<'_>], order: &dyn RecordOrder, a: usize, b: usize) -> bool {
    order.compare(cursors[a].current(), cursors[b].current()) == Ordering::Equal
}

/// Whether every remaining record on the head's current page still comes
/// before the runner-up, so the head can be drained without re-sorting.
fn head_stays_first(
    cursors: &[RunCursor<'_>],
    order: &dyn RecordOrder,
    list: &[Candidate],
    eliminate: bool,
    scratch: &mut Vec<u8>,
) -> Result<bool> {
    let (head, second) = match list {
        [] => return Ok(false),
        [_] => return Ok(true),
        [head, second, ..] => (head.cursor, second.cursor),
    };
    if !cursors[head].at_page_start() {
        return Ok(false);
    }

    let last = cursors[head].last_on_page(scratch)?;
    Ok(match order.compare(last, cursors[second].current()) {
        Ordering::Less => true,
        Ordering::Equal => !eliminate && head < second,
        Ordering::Greater => false,
    })
}

/// K-way merge of the runs under `cursors`, handing at most `cap` records to `emit`.
///
/// Under `Eliminate` a record equal to the one before it in the candidate
/// list is skipped, so only the first occurrence of a key is emitted.
pub(crate) fn merge_cursors<'a, F>(
    cursors: &mut [RunCursor<'a>],
    order: &dyn RecordOrder,
    policy: DuplicatePolicy,
    cap: usize,
    mut emit: F,
) -> Result<MergeSummary>
where
    F: FnMut(&RunCursor<'a>) -> Result<Flow>,
{
    let eliminate = policy == DuplicatePolicy::Eliminate;
    let mut summary = MergeSummary {
        flow: Flow::Continue,
        emitted: 0,
        duplicates: 0,
    };
    if cap == 0 {
        return Ok(summary);
    }

    let mut list: Vec<Candidate> = (0..cursors.len())
        .map(|cursor| Candidate {
            cursor,
            duplicate: false,
        })
        .collect();
    for i in 1..list.len() {
        let mut j = i;
        while j > 0 && precedes(cursors, order, list[j].cursor, list[j - 1].cursor) {
            list.swap(j, j - 1);
            j -= 1;
        }
    }
    if eliminate {
        for i in 1..list.len() {
            list[i].duplicate = same_key(cursors, order, list[i - 1].cursor, list[i].cursor);
        }
    }

    let mut scratch = Vec::new();
    let mut shortcut = head_stays_first(cursors, order, &list, eliminate, &mut scratch)?;

    while let Some(&head) = list.first() {
        if eliminate && head.duplicate {
            summary.duplicates += 1;
        } else {
            summary.emitted += 1;
            if emit(&cursors[head.cursor])? == Flow::Stop {
                summary.flow = Flow::Stop;
                return Ok(summary);
            }
            if summary.emitted >= cap {
                break;
            }
        }

        match cursors[head.cursor].advance()? {
            Advance::Exhausted => {
                list.remove(0);
                shortcut = head_stays_first(cursors, order, &list, eliminate, &mut scratch)?;
                continue;
            }
            Advance::SamePage if shortcut => {
                list[0].duplicate = false;
                continue;
            }
            Advance::SamePage | Advance::NewPage => {}
        }

        let moved = list.remove(0).cursor;
        let mut at = 0;
        while at < list.len() && precedes(cursors, order, list[at].cursor, moved) {
            at += 1;
        }
        let duplicate = eliminate && at > 0 && same_key(cursors, order, list[at - 1].cursor, moved);
        list.insert(at, Candidate { cursor: moved, duplicate });
        if eliminate
            && at + 1 < list.len()
            && same_key(cursors, order, moved, list[at + 1].cursor)
        {
            list[at + 1].duplicate = true;
        }

        shortcut = head_stays_first(cursors, order, &list, eliminate, &mut scratch)?;
    }

    Ok(summary)
}

/// Input and output halves of a per-file table.
fn split_halves<T>(items: &mut [T], half: usize, in_half: usize) -> (&mut [T], &mut [T]) {
    let (low, high) = items.split_at_mut(half);
    if in_half == 0 {
        (low, high)
    } else {
        (high, low)
    }
}

/// Positions every active input file's cursor on its first live run.
fn open_input_cursors<'a>(
    inputs: &'a [Option<TempFile>],
    ledgers: &[RunLedger],
    overflow: Option<&'a OverflowFile>,
    memory: &'a mut [u8],
    section_bytes: usize,
    start_pages: &[usize],
    first_index: usize,
) -> Result<Vec<RunCursor<'a>>> {
    let mut cursors = Vec::with_capacity(ledgers.len());
    for (offset, section) in memory
        .chunks_exact_mut(section_bytes)
        .take(ledgers.len())
        .enumerate()
    {
        let file_index = first_index + offset;
        let file = inputs[offset].as_ref().ok_or(SortError::CorruptedLedger {
            file: file_index,
            reason: "runs recorded for a missing temp file",
        })?;
        let pages = ledgers[offset].first_run_pages().ok_or(SortError::CorruptedLedger {
            file: file_index,
            reason: "active file without a live run",
        })?;
        cursors.push(RunCursor::open(
            file,
            file_index,
            overflow,
            section,
            start_pages[offset],
            pages,
        )?);
    }
    Ok(cursors)
}

/// Runs merge passes until a single run remains.
///
/// With a sink the last pass streams its run to it; without one the final
/// run stays in file `in_half` of the context.
pub(crate) fn merge_runs(
    ctx: &mut SortContext<'_>,
    sink: Option<&mut dyn RecordSink>,
) -> Result<Flow> {
    let mut memory = std::mem::take(&mut ctx.memory);
    let flow = merge_runs_with(ctx, &mut memory, sink);
    ctx.memory = memory;
    flow
}

fn merge_runs_with(
    ctx: &mut SortContext<'_>,
    memory: &mut [u8],
    mut sink: Option<&mut dyn RecordSink>,
) -> Result<Flow> {
    ctx.create_output_files()?;

    loop {
        let active = ctx.active_input_files();
        if active <= 1 {
            return Ok(Flow::Continue);
        }

        let half = ctx.half_files;
        let in_half = ctx.in_half;
        let out_half = ctx.out_half();
        let num_runs = ctx.ledgers[in_half..in_half + half]
            .iter()
            .map(RunLedger::run_count)
            .max()
            .unwrap_or(0);
        let very_last = num_runs == 1 && sink.is_some();

        if !very_last {
            ctx.prepare_output_files()?;
        }
        for ledger in &mut ctx.ledgers[out_half..out_half + half] {
            ledger.clear();
        }
        ctx.stats.merge_passes += 1;
        debug!(pass = ctx.stats.merge_passes, active, num_runs, very_last, "merge pass");

        let mut in_pages = vec![0usize; half];
        let mut out_pages = vec![0usize; half];
        let mut out_file = 0;

        for remaining in (1..=num_runs).rev() {
            let mut files = active;
            if remaining == 1 && !very_last {
                files = ctx.active_input_files();
                if files == 1 {
                    let out_page = &mut out_pages[out_file];
                    copy_lone_run(ctx, memory, &mut in_pages[0], out_file, out_page)?;
                    ctx.ledgers[in_half].remove_first();
                    out_file = (out_file + 1) % half;
                    continue;
                }
            }

            if very_last {
                let sink = sink
                    .as_deref_mut()
                    .ok_or(SortError::Internal("final pass without a sink"))?;
                let target = MergeTarget::Sink(sink);
                let summary = merge_group(ctx, memory, files, &mut in_pages, target)?;
                ctx.in_half = out_half;
                return Ok(summary.flow);
            }

            let target = MergeTarget::Run {
                offset: out_file,
                start_page: out_pages[out_file],
            };
            let summary = merge_group(ctx, memory, files, &mut in_pages, target)?;
            let pages = summary.run_pages;
            out_pages[out_file] += pages;

            for ledger in &mut ctx.ledgers[in_half..in_half + half] {
                ledger.remove_first();
            }
            ctx.ledgers[out_half + out_file].add_run(pages)?;
            ctx.stats.pages_written += pages;
            out_file = (out_file + 1) % half;
        }

        ctx.in_half = out_half;
    }
}

enum MergeTarget<'s> {
    Run { offset: usize, start_page: usize },
    Sink(&'s mut dyn RecordSink),
}

struct GroupResult {
    flow: Flow,
    run_pages: usize,
}

/// Merges the next run of the first `files` input files into `target`.
fn merge_group(
    ctx: &mut SortContext<'_>,
    memory: &mut [u8],
    files: usize,
    in_pages: &mut [usize],
    target: MergeTarget<'_>,
) -> Result<GroupResult> {
    let page_size = ctx.page_size;
    let half = ctx.half_files;
    let in_half = ctx.in_half;
    let out_half = ctx.out_half();
    let section_pages = input_section_pages(ctx.tot_buffers, files);
    let order = ctx.order;
    let policy = ctx.policy;
    let cap = ctx.limit.unwrap_or(usize::MAX);

    let (input_memory, output_memory) = memory.split_at_mut(section_pages * files * page_size);
    let (inputs, outputs) = split_halves(&mut ctx.files, half, in_half);
    let ledgers = &ctx.ledgers[in_half..in_half + files];
    let overflow = ctx.overflow.as_ref();
    let stats = &mut ctx.stats;

    let mut cursors = open_input_cursors(
        inputs,
        ledgers,
        overflow,
        input_memory,
        section_pages * page_size,
        in_pages,
        in_half,
    )?;

    let (summary, run_pages) = match target {
        MergeTarget::Run { offset, start_page } => {
            let file = outputs[offset].as_mut().ok_or(SortError::CorruptedLedger {
                file: out_half + offset,
                reason: "output temp file retired before use",
            })?;
            let mut writer = RunWriter::new(file, output_memory, page_size, start_page);
            let summary = merge_cursors(&mut cursors, order, policy, cap, |cursor| {
                let record = cursor.raw();
                writer.push(record.data, record.kind)?;
                Ok(Flow::Continue)
            })?;
            let (pages, _) = writer.finish()?;
            (summary, pages)
        }
        MergeTarget::Sink(sink) => {
            let summary = merge_cursors(&mut cursors, order, policy, cap, |cursor| {
                sink.consume(cursor.current()).map_err(SortError::Output)
            })?;
            stats.records_emitted += summary.emitted;
            (summary, 0)
        }
    };

    for cursor in &cursors {
        in_pages[cursor.file_index() - in_half] = cursor.end_page();
        stats.pages_read += cursor.pages_read();
    }
    stats.duplicates_removed += summary.duplicates;

    Ok(GroupResult {
        flow: summary.flow,
        run_pages,
    })
}

/// Copies the only remaining input run page by page into the output file.
fn copy_lone_run(
    ctx: &mut SortContext<'_>,
    memory: &mut [u8],
    in_page: &mut usize,
    out_offset: usize,
    out_page: &mut usize,
) -> Result<()> {
    let page_size = ctx.page_size;
    let half = ctx.half_files;
    let in_half = ctx.in_half;
    let out_half = ctx.out_half();
    let run_pages = ctx.ledgers[in_half].first_run_pages().ok_or(SortError::CorruptedLedger {
        file: in_half,
        reason: "lone input file without a live run",
    })?;

    let (inputs, outputs) = split_halves(&mut ctx.files, half, in_half);
    let input = inputs[0].as_ref().ok_or(SortError::CorruptedLedger {
        file: in_half,
        reason: "runs recorded for a missing temp file",
    })?;
    let output = outputs[out_offset].as_mut().ok_or(SortError::CorruptedLedger {
        file: out_half + out_offset,
        reason: "output temp file retired before use",
    })?;

    let chunk_pages = (memory.len() / page_size).max(1);
    let mut copied = 0;
    while copied < run_pages {
        let count = chunk_pages.min(run_pages - copied);
        let buffer = &mut memory[..count * page_size];
        input.read_pages(*in_page + copied, buffer)?;
        output.write_pages(*out_page + copied, buffer)?;
        copied += count;
    }

    *in_page += run_pages;
    *out_page += run_pages;
    ctx.ledgers[out_half + out_offset].add_run(run_pages)?;
    ctx.stats.pages_read += run_pages;
    ctx.stats.pages_written += run_pages;
    ctx.stats.pass_through_copies += 1;
    debug!(pages = run_pages, "copied lone run to output half");
    Ok(())
}

/// Streams the single run held by the input half straight to the sink.
pub(crate) fn stream_single_run(
    ctx: &mut SortContext<'_>,
    sink: &mut dyn RecordSink,
) -> Result<Flow> {
    let mut memory = std::mem::take(&mut ctx.memory);
    let result = merge_group(ctx, &mut memory, 1, &mut [0], MergeTarget::Sink(sink));
    ctx.memory = memory;
    Ok(result?.flow)
}
