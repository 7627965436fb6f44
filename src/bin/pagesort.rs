use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;
use pagesort::constants::{BYTES_PER_GB, DEFAULT_CONFIG_FILE};
use pagesort::external_sort::{sort_file, DuplicatePolicy, ExternalSortConfig};
use pagesort::utils::{format_bytes, format_rate, setup_logging};

#[derive(Parser)]
#[command(name = "pagesort")]
#[command(about = "Page-oriented external merge sort for newline-delimited records")]
#[command(version)]
struct Args {
    #[arg(short, long, required = true, num_args = 1.., help = "Input files, sorted together")]
    input: Vec<PathBuf>,

    #[arg(short, long, help = "Output file for the sorted records")]
    output: PathBuf,

    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE, help = "Configuration file")]
    config: PathBuf,

    #[arg(short, long, help = "Drop records that compare equal, keeping the first")]
    unique: bool,

    #[arg(short, long, help = "Emit at most this many records")]
    limit: Option<usize>,

    #[arg(short, long, help = "Sort partitions on parallel workers")]
    parallel: bool,

    #[arg(short, long, help = "Number of parallel workers")]
    workers: Option<usize>,

    #[arg(short, long, help = "Sort buffer size in pages")]
    buffer_pages: Option<usize>,

    #[arg(short, long, help = "Verbose output")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(if args.verbose { "verbose" } else { "normal" })?;

    let mut config = if args.config.exists() {
        ExternalSortConfig::from_file(&args.config)?
    } else {
        println!("Config file not found, creating default: {}", args.config.display());
        let default_config = ExternalSortConfig::default();
        default_config.to_file(&args.config)?;
        default_config
    };

    if args.unique {
        config.duplicates = DuplicatePolicy::Eliminate;
    }
    if args.limit.is_some() {
        config.limit = args.limit;
    }
    if args.parallel {
        config.parallel = true;
    }
    if let Some(workers) = args.workers {
        config.parallel_workers = workers;
    }
    if let Some(pages) = args.buffer_pages {
        config.buffer_pages = pages;
    }
    if args.verbose {
        config.verbose = true;
    }
    config.validate()?;

    for path in &args.input {
        if !path.is_file() {
            return Err(anyhow::anyhow!("Input file does not exist: {}", path.display()));
        }
    }

    let total_size: u64 = args
        .input
        .iter()
        .filter_map(|f| std::fs::metadata(f).ok())
        .map(|m| m.len())
        .sum();

    println!("Input: {} file(s), {}", args.input.len(), format_bytes(total_size));
    println!("Output: {}", args.output.display());
    println!(
        "Sort buffer: {} ({} pages of {} KB), memory limit {:.2} GB",
        format_bytes(config.buffer_bytes() as u64),
        config.effective_buffer_pages(),
        config.page_size_kb(),
        config.memory_limit_bytes() as f64 / BYTES_PER_GB
    );

    let start_time = Instant::now();
    let stats = sort_file(&args.input, &args.output, config).await?;
    let total_time = start_time.elapsed();

    println!();
    println!("Records read: {}", stats.records_fetched);
    println!("Records written: {}", stats.records_emitted);
    if stats.duplicates_removed > 0 {
        println!("Duplicates removed: {}", stats.duplicates_removed);
    }
    println!("Runs created: {}", stats.runs_created);
    println!("Merge passes: {}", stats.merge_passes);
    if stats.overflow_records > 0 {
        println!("Overflow records: {}", stats.overflow_records);
    }
    if stats.workers > 1 {
        println!("Workers: {}", stats.workers);
    }
    println!("Total time: {:.2}s", total_time.as_secs_f64());
    println!("Throughput: {}", format_rate(stats.records_fetched, stats.processing_time_ms));

    Ok(())
}
