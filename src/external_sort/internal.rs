use tracing::debug;

use crate::external_sort::callbacks::{FetchStatus, Flow, RecordSink, RecordSource};
use crate::external_sort::config::DuplicatePolicy;
use crate::external_sort::constants::{MIN_FETCH_AREA, PROGRESS_REPORT_INTERVAL_RECORDS};
use crate::external_sort::context::SortContext;
use crate::external_sort::error::{Result, SortError};
use crate::external_sort::flush::RunWriter;
use crate::external_sort::page::{max_record_len, RecordKind};
use crate::external_sort::run_sort::SortArena;

/// How the in-memory phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InternalOutcome {
    /// Everything fit in memory and went straight to the sink.
    Streamed(Flow),
    /// Zero or more runs sit in the input half; see `SortContext::tot_runs`.
    Spilled,
}

enum Fetched {
    Stored(usize),
    Full(usize),
    Exhausted,
}

/// Reads the whole input, producing sorted runs in the input-half temp files.
///
/// With a sink, input that never fills the arena is sorted and delivered
/// directly. Without one every record ends up in a run.
pub(crate) fn sort_input(
    ctx: &mut SortContext<'_>,
    source: &mut dyn RecordSource,
    sink: Option<&mut dyn RecordSink>,
) -> Result<InternalOutcome> {
    let mut memory = std::mem::take(&mut ctx.memory);
    let outcome = sort_input_with(ctx, &mut memory, source, sink);
    ctx.memory = memory;
    outcome
}

fn sort_input_with(
    ctx: &mut SortContext<'_>,
    memory: &mut [u8],
    source: &mut dyn RecordSource,
    sink: Option<&mut dyn RecordSink>,
) -> Result<InternalOutcome> {
    let page_size = ctx.page_size;
    let max_len = max_record_len(page_size);
    let (arena_memory, output_page) = memory.split_at_mut((ctx.tot_buffers - 1) * page_size);
    let output_page = &mut output_page[..page_size];

    let mut arena = SortArena::new(arena_memory, max_len);
    let mut keys: Vec<u32> = Vec::new();
    let mut scratch: Vec<u32> = Vec::new();
    let mut long_record: Vec<u8> = Vec::new();
    let mut sorted_prefix = 0;

    loop {
        let fetched = {
            let area = arena.fetch_area();
            let area_len = area.len();
            if area_len < MIN_FETCH_AREA {
                Fetched::Full(MIN_FETCH_AREA)
            } else {
                match source.fetch(area).map_err(SortError::Input)? {
                    FetchStatus::Record(len) if len > area_len => {
                        return Err(SortError::InvalidRecord { len, area: area_len })
                    }
                    FetchStatus::Record(len) => Fetched::Stored(len),
                    FetchStatus::DoesNotFit(needed) => Fetched::Full(needed),
                    FetchStatus::Exhausted => Fetched::Exhausted,
                }
            }
        };

        match fetched {
            Fetched::Stored(len) => {
                keys.push(arena.commit(len)?);
                ctx.stats.records_fetched += 1;
                if ctx.stats.records_fetched % PROGRESS_REPORT_INTERVAL_RECORDS == 0 {
                    debug!(
                        records = ctx.stats.records_fetched,
                        runs = ctx.tot_runs,
                        "sort input progress"
                    );
                }
            }
            Fetched::Full(needed) => {
                if arena.is_empty() {
                    if needed <= max_len {
                        return Err(SortError::Internal(
                            "input source refused an area large enough for its record",
                        ));
                    }
                } else {
                    // A retain with nothing new since the last one cannot make room.
                    let grew = keys.len() > sorted_prefix;
                    sort_arena(ctx, &mut arena, &mut keys, &mut scratch, sorted_prefix);

                    if ctx.policy == DuplicatePolicy::Eliminate
                        && grew
                        && needed <= max_len
                        && arena.can_retain(&keys, needed, page_size)
                    {
                        arena.retain_sorted(&mut keys)?;
                        sorted_prefix = keys.len();
                        continue;
                    }

                    flush_arena(ctx, &arena, &keys, output_page)?;
                    arena.reset();
                    keys.clear();
                    sorted_prefix = 0;
                }

                if needed > max_len {
                    spill_long_record(ctx, source, needed, &mut long_record, output_page)?;
                }
            }
            Fetched::Exhausted => break,
        }
    }

    if arena.is_empty() {
        return Ok(InternalOutcome::Spilled);
    }

    sort_arena(ctx, &mut arena, &mut keys, &mut scratch, sorted_prefix);
    match sink {
        Some(sink) if ctx.tot_runs == 0 => {
            let flow = stream_arena(ctx, &arena, &keys, sink)?;
            Ok(InternalOutcome::Streamed(flow))
        }
        _ => {
            flush_arena(ctx, &arena, &keys, output_page)?;
            Ok(InternalOutcome::Spilled)
        }
    }
}

fn sort_arena(
    ctx: &mut SortContext<'_>,
    arena: &mut SortArena<'_>,
    keys: &mut Vec<u32>,
    scratch: &mut Vec<u32>,
    sorted_prefix: usize,
) {
    let mut sorter = arena.sorter(ctx.order, ctx.policy);
    sorter.sort(keys, scratch, sorted_prefix);
    ctx.stats.duplicates_removed += sorter.eliminated();
}

/// Temp file that receives the next run: runs are dealt round robin over the input half.
fn next_run_file(ctx: &SortContext<'_>) -> usize {
    ctx.in_half + ctx.tot_runs % ctx.half_files
}

fn flush_arena(
    ctx: &mut SortContext<'_>,
    arena: &SortArena<'_>,
    keys: &[u32],
    output_page: &mut [u8],
) -> Result<()> {
    let index = next_run_file(ctx);
    let start_page = ctx.ledgers[index].total_pages();
    let cap = ctx.limit.unwrap_or(usize::MAX);
    let page_size = ctx.page_size;
    let estimate = ctx.tmp_file_pages;

    let file = ctx.ensure_file(index, estimate)?;
    let mut writer = RunWriter::new(file, output_page, page_size, start_page);
    'records: for &key in keys {
        for record in arena.chain(key) {
            if writer.records() >= cap {
                break 'records;
            }
            writer.push(record, RecordKind::Home)?;
        }
    }
    let records = writer.records();
    let (pages, _) = writer.finish()?;

    record_run(ctx, index, pages)?;
    debug!(file = index, pages, records, "flushed run");
    Ok(())
}

fn record_run(ctx: &mut SortContext<'_>, index: usize, pages: usize) -> Result<()> {
    ctx.ledgers[index].add_run(pages)?;
    ctx.tot_runs += 1;
    ctx.stats.runs_created += 1;
    ctx.stats.pages_written += pages;
    Ok(())
}

/// Moves a record longer than a page to the overflow file and flushes its
/// locator as a one-record run, after the runs flushed before it.
fn spill_long_record(
    ctx: &mut SortContext<'_>,
    source: &mut dyn RecordSource,
    needed: usize,
    buffer: &mut Vec<u8>,
    output_page: &mut [u8],
) -> Result<()> {
    buffer.clear();
    buffer
        .try_reserve_exact(needed)
        .map_err(|_| SortError::OutOfMemory { bytes: needed })?;
    buffer.resize(needed, 0);

    let len = match source.fetch(buffer).map_err(SortError::Input)? {
        FetchStatus::Record(len) if len <= needed => len,
        FetchStatus::Record(len) => return Err(SortError::InvalidRecord { len, area: needed }),
        FetchStatus::DoesNotFit(_) | FetchStatus::Exhausted => {
            return Err(SortError::Internal("input source lost its oversized record"))
        }
    };
    buffer.truncate(len);

    let locator = ctx.overflow_mut()?.insert(&buffer[..])?;
    ctx.stats.records_fetched += 1;
    ctx.stats.overflow_records += 1;

    let index = next_run_file(ctx);
    let start_page = ctx.ledgers[index].total_pages();
    let page_size = ctx.page_size;
    let estimate = ctx.tmp_file_pages;
    let file = ctx.ensure_file(index, estimate)?;
    let mut writer = RunWriter::new(file, output_page, page_size, start_page);
    writer.push(&locator.encode(), RecordKind::Big)?;
    let (pages, _) = writer.finish()?;

    record_run(ctx, index, pages)?;
    debug!(file = index, bytes = len, "flushed overflow record run");
    Ok(())
}

fn stream_arena(
    ctx: &mut SortContext<'_>,
    arena: &SortArena<'_>,
    keys: &[u32],
    sink: &mut dyn RecordSink,
) -> Result<Flow> {
    let cap = ctx.limit.unwrap_or(usize::MAX);
    for &key in keys {
        for record in arena.chain(key) {
            if ctx.stats.records_emitted >= cap {
                return Ok(Flow::Continue);
            }
            ctx.stats.records_emitted += 1;
            if sink.consume(record).map_err(SortError::Output)? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
    }
    Ok(Flow::Continue)
}
