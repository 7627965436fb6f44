use anyhow::Result;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;
use pagesort::external_sort::{LineOrder, LineSink, LineSource, PagedInput};
use pagesort::{sort_file, DuplicatePolicy, ExternalSortConfig, ExternalSortProcessor};

/// Helper function to write a few input files of newline-delimited records
fn create_test_data(temp_dir: &TempDir) -> Result<Vec<PathBuf>> {
    let input_dir = temp_dir.path().join("input");
    fs::create_dir_all(&input_dir)?;

    let first = input_dir.join("part1.txt");
    fs::write(
        &first,
        "user1@example.com,password123\ntest@gmail.com,secret456\n\
         admin@site.org,admin789\nuser1@example.com,password123\n",
    )?;

    let second = input_dir.join("part2.txt");
    fs::write(
        &second,
        "john@doe.com,mypass\njane@smith.net,janepass\n\
         user1@example.com,other\nTEST@gmail.com,secret456\n",
    )?;

    Ok(vec![first, second])
}

/// Helper function to create a small-buffer configuration that forces spilling
fn create_test_config(temp_dir: &TempDir) -> ExternalSortConfig {
    ExternalSortConfig {
        page_size: 512,
        buffer_pages: 4,
        temp_directory: temp_dir.path().join("spill"),
        ..ExternalSortConfig::default()
    }
}

fn read_lines(path: &PathBuf) -> Result<Vec<String>> {
    Ok(fs::read_to_string(path)?.lines().map(str::to_string).collect())
}

#[tokio::test]
async fn test_sort_file_keeps_every_line() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let inputs = create_test_data(&temp_dir)?;
    let output = temp_dir.path().join("sorted.txt");

    let stats = sort_file(&inputs, &output, create_test_config(&temp_dir)).await?;

    let lines = read_lines(&output)?;
    let mut expected: Vec<String> = inputs
        .iter()
        .flat_map(|p| {
            let text = fs::read_to_string(p).unwrap();
            text.lines().map(str::to_string).collect::<Vec<_>>()
        })
        .collect();
    expected.sort();
    assert_eq!(lines, expected);
    assert_eq!(stats.records_fetched, 8);
    assert_eq!(stats.records_emitted, 8);
    Ok(())
}

#[tokio::test]
async fn test_sort_file_unique_by_field_ignoring_case() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let inputs = create_test_data(&temp_dir)?;
    let output = temp_dir.path().join("unique.txt");

    let mut config = create_test_config(&temp_dir);
    config.duplicates = DuplicatePolicy::Eliminate;
    config.case_sensitive = false;
    config.key_field = Some(0);

    let stats = sort_file(&inputs, &output, config).await?;

    assert_eq!(
        read_lines(&output)?,
        vec![
            "admin@site.org,admin789",
            "jane@smith.net,janepass",
            "john@doe.com,mypass",
            "test@gmail.com,secret456",
            "user1@example.com,password123",
        ]
    );
    assert_eq!(stats.duplicates_removed, 3);
    Ok(())
}

#[tokio::test]
async fn test_sort_file_large_input_with_limit() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let input = temp_dir.path().join("numbers.txt");
    let content: String = (0..20_000u32)
        .map(|i| format!("{:08}\n", (i * 7_919) % 20_011))
        .collect();
    fs::write(&input, content)?;
    let output = temp_dir.path().join("top.txt");

    let mut config = create_test_config(&temp_dir);
    config.limit = Some(3);
    let stats = sort_file(&[input], &output, config).await?;

    assert_eq!(read_lines(&output)?, vec!["00000000", "00000001", "00000002"]);
    assert!(stats.runs_created > 1);
    assert_eq!(stats.records_emitted, 3);
    Ok(())
}

#[tokio::test]
async fn test_sort_file_parallel_matches_serial() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let input = temp_dir.path().join("words.txt");
    let content: String = (0..5_000u32)
        .map(|i| format!("word{:05},{}\n", (i * 31) % 997, i))
        .collect();
    fs::write(&input, content)?;

    let mut config = create_test_config(&temp_dir);
    config.key_field = Some(0);
    let serial_output = temp_dir.path().join("serial.txt");
    sort_file(&[input.clone()], &serial_output, config.clone()).await?;

    config.parallel = true;
    config.parallel_workers = 3;
    let parallel_output = temp_dir.path().join("parallel.txt");
    let stats = sort_file(&[input], &parallel_output, config).await?;

    assert_eq!(fs::read(&parallel_output)?, fs::read(&serial_output)?);
    assert_eq!(stats.workers, 3);
    Ok(())
}

#[tokio::test]
async fn test_missing_input_fails() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let output = temp_dir.path().join("out.txt");
    let missing = vec![temp_dir.path().join("nope.txt")];

    let result = sort_file(&missing, &output, create_test_config(&temp_dir)).await;
    assert!(result.is_err());
    Ok(())
}

#[test]
fn test_config_round_trip_and_validation() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("pagesort_config.json");

    let mut config = create_test_config(&temp_dir);
    config.duplicates = DuplicatePolicy::Eliminate;
    config.limit = Some(100);
    config.to_file(&path)?;

    let loaded = ExternalSortConfig::from_file(&path)?;
    assert_eq!(loaded.duplicates, DuplicatePolicy::Eliminate);
    assert_eq!(loaded.limit, Some(100));
    assert_eq!(loaded.page_size, 512);
    assert_eq!(loaded.buffer_bytes(), 4 * 512);

    fs::write(&path, r#"{ "page_size": 100 }"#)?;
    assert!(ExternalSortConfig::from_file(&path).is_err());

    fs::write(&path, r#"{ "duplicates": "eliminate" }"#)?;
    let partial = ExternalSortConfig::from_file(&path)?;
    assert_eq!(partial.duplicates, DuplicatePolicy::Eliminate);
    assert_eq!(partial.buffer_pages, ExternalSortConfig::default().buffer_pages);
    Ok(())
}

#[test]
fn test_processor_with_line_adapters() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let inputs = create_test_data(&temp_dir)?;
    let config = create_test_config(&temp_dir);
    let processor = ExternalSortProcessor::new(config.clone())?;

    let mut source = LineSource::new(inputs);
    let input = PagedInput::from_source(&mut source, config.page_size)?;
    let mut sink = LineSink::new(Vec::new());
    let order = LineOrder::new(true, Some(1), ',');
    processor.sort_partitioned(&input, &mut sink, &order)?;

    let text = String::from_utf8(sink.into_inner()?)?;
    let passwords: Vec<&str> = text.lines().map(|l| l.split(',').nth(1).unwrap_or("")).collect();
    let mut sorted = passwords.clone();
    sorted.sort();
    assert_eq!(passwords, sorted);
    assert_eq!(passwords.len(), 8);
    Ok(())
}
