//! batchq CLI: operator interface to the control store.
//!
//! Processing itself is a library call, since the business logic is user
//! code. This binary imports data, reports progress, and exports results.

use batchq::config::{Config, DEFAULT_MAX_RETRIES, ProjectConfig};
use batchq::export::{ExportFormat, export_to_path};
use batchq::model::{ItemFilter, ItemKey, Schema};
use batchq::source::{DataSource, DelimitedFileSource};
use batchq::store::{ControlStore, ImportMode};
use batchq::telemetry::{TelemetryConfig, init_telemetry};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "batchq", about = "Resumable batch execution")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import a delimited file into a run
    Import {
        /// Source file (header line required)
        file: Option<PathBuf>,
        /// Project TOML supplying run name, source, and schema
        #[arg(long)]
        config: Option<PathBuf>,
        /// Run name
        #[arg(long)]
        run: Option<String>,
        /// Primary key column
        #[arg(long)]
        key: Option<String>,
        /// Required business columns
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,
        /// Result columns written by processing
        #[arg(long, value_delimiter = ',')]
        results: Vec<String>,
        /// create-if-absent | skip-if-exists | overwrite
        #[arg(long, default_value = "create-if-absent")]
        mode: ImportMode,
        /// Column delimiter
        #[arg(long, default_value_t = '\t')]
        delimiter: char,
        /// Retry budget to record for the run
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Show progress of one run, or of every run
    Status {
        #[arg(long)]
        run: Option<String>,
        /// Retries allowed after the first attempt; defaults to the run's
        /// recorded budget
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// List items of a run
    List {
        #[arg(long)]
        run: String,
        /// all | processed | pending | exhausted
        #[arg(long, default_value = "all")]
        filter: ItemFilter,
        #[arg(long)]
        max_retries: Option<u32>,
        /// Maximum items to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show one item
    Show {
        #[arg(long)]
        run: String,
        key: ItemKey,
    },
    /// Export a run to CSV or JSON lines
    Export {
        /// Output file; the extension picks the format unless --format is given
        path: PathBuf,
        #[arg(long)]
        run: String,
        /// csv | jsonl
        #[arg(long)]
        format: Option<ExportFormat>,
        /// Only items whose results were written
        #[arg(long)]
        only_processed: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "batchq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let store = ControlStore::connect(config.database_url.expose_secret()).await?;
    store.migrate().await?;

    let result = match cli.command {
        Command::Import {
            file,
            config,
            run,
            key,
            fields,
            results,
            mode,
            delimiter,
            max_retries,
        } => {
            let args = ImportArgs {
                file,
                config,
                run,
                key,
                fields,
                results,
                mode,
                delimiter,
                max_retries,
            };
            cmd_import(&store, args).await
        }
        Command::Status { run, max_retries } => cmd_status(&store, run, max_retries).await,
        Command::List {
            run,
            filter,
            max_retries,
            limit,
        } => cmd_list(&store, &run, filter, max_retries, limit).await,
        Command::Show { run, key } => cmd_show(&store, &run, &key).await,
        Command::Export {
            path,
            run,
            format,
            only_processed,
        } => cmd_export(&store, path, &run, format, only_processed).await,
    };

    store.close().await;
    result
}

struct ImportArgs {
    file: Option<PathBuf>,
    config: Option<PathBuf>,
    run: Option<String>,
    key: Option<String>,
    fields: Vec<String>,
    results: Vec<String>,
    mode: ImportMode,
    delimiter: char,
    max_retries: Option<u32>,
}

async fn cmd_import(store: &ControlStore, args: ImportArgs) -> anyhow::Result<()> {
    let project = args
        .config
        .as_deref()
        .map(ProjectConfig::load)
        .transpose()?;

    // Command-line flags override the project file.
    let run = match (args.run, &project) {
        (Some(run), _) => run,
        (None, Some(project)) => project.run.run_name.clone(),
        (None, None) => anyhow::bail!("--run or --config is required"),
    };

    let max_retries = args
        .max_retries
        .or_else(|| project.as_ref().map(|p| p.run.max_retries));

    let project_source = project.as_ref().and_then(|p| p.source.clone());
    let (path, delimiter) = match (args.file, project_source) {
        (Some(file), _) => (file, args.delimiter),
        (None, Some(source)) => (source.path, source.delimiter),
        (None, None) => anyhow::bail!("a source file or a [source] table is required"),
    };

    let schema = match (args.key, project.and_then(|p| p.schema)) {
        (Some(key), _) => Schema::new(key)
            .business_fields(args.fields)
            .result_fields(args.results),
        (None, Some(schema)) => schema,
        (None, None) => anyhow::bail!("--key or a [schema] table is required"),
    };

    let rows = DelimitedFileSource::new(&path)
        .delimiter(delimiter)?
        .load_rows()?;
    let summary = store.import_source(&run, &schema, &rows, args.mode).await?;
    if let Some(max_retries) = max_retries {
        store.set_max_retries(&run, max_retries).await?;
    }

    println!(
        "Imported {} into {run}: {} inserted, {} skipped, {} removed ({} source rows)",
        path.display(),
        summary.inserted,
        summary.skipped,
        summary.removed,
        summary.source_rows
    );
    Ok(())
}

async fn cmd_status(
    store: &ControlStore,
    run: Option<String>,
    max_retries: Option<u32>,
) -> anyhow::Result<()> {
    let runs = match run {
        Some(run) => vec![run],
        None => store.runs().await?,
    };

    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }

    println!(
        "{:<24}  {:>8}  {:>9}  {:>8}  {:>9}  {:>6}",
        "RUN", "TOTAL", "PROCESSED", "PENDING", "EXHAUSTED", "DONE"
    );
    println!("{}", "-".repeat(76));
    for run in &runs {
        let budget = store
            .resolve_max_retries(run, max_retries, DEFAULT_MAX_RETRIES)
            .await?;
        let stats = store.statistics(run, budget).await?;
        let percent = if stats.total == 0 {
            0.0
        } else {
            stats.processed as f64 * 100.0 / stats.total as f64
        };
        println!(
            "{:<24}  {:>8}  {:>9}  {:>8}  {:>9}  {:>5.1}%",
            run, stats.total, stats.processed, stats.pending, stats.exhausted, percent
        );
    }
    Ok(())
}

async fn cmd_list(
    store: &ControlStore,
    run: &str,
    filter: ItemFilter,
    max_retries: Option<u32>,
    limit: i64,
) -> anyhow::Result<()> {
    let max_retries = store
        .resolve_max_retries(run, max_retries, DEFAULT_MAX_RETRIES)
        .await?;
    let items = store.items(run, filter, max_retries, Some(limit)).await?;

    if items.is_empty() {
        println!("No items found.");
        return Ok(());
    }

    println!(
        "{:<12}  {:<10}  {:<5}  {:<40}  UPDATED",
        "KEY", "STATUS", "TRIES", "LAST ERROR"
    );
    println!("{}", "-".repeat(90));

    for item in &items {
        let error: String = item
            .last_error
            .as_deref()
            .unwrap_or("-")
            .chars()
            .take(40)
            .collect();
        println!(
            "{:<12}  {:<10}  {:<5}  {:<40}  {}",
            item.key.to_string(),
            item.status(max_retries),
            item.retry_count,
            error,
            item.updated_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} item(s)", items.len());
    Ok(())
}

async fn cmd_show(store: &ControlStore, run: &str, key: &ItemKey) -> anyhow::Result<()> {
    let item = store.get_item(run, key).await?;
    let max_retries = store
        .resolve_max_retries(run, None, DEFAULT_MAX_RETRIES)
        .await?;

    println!("Key:        {}", item.key);
    println!("Status:     {}", item.status(max_retries));
    println!("Processed:  {}", item.is_processed);
    println!("Retries:    {}", item.retry_count);
    println!("Last Error: {}", item.last_error.as_deref().unwrap_or("-"));
    println!("Fields:     {}", serde_json::to_string_pretty(&item.fields)?);
    println!("Results:    {}", serde_json::to_string_pretty(&item.results)?);
    println!("Created:    {}", item.created_at);
    println!("Updated:    {}", item.updated_at);
    Ok(())
}

async fn cmd_export(
    store: &ControlStore,
    path: PathBuf,
    run: &str,
    format: Option<ExportFormat>,
    only_processed: bool,
) -> anyhow::Result<()> {
    let Some(schema) = store.run_schema(run).await? else {
        anyhow::bail!("run '{run}' has never been imported");
    };
    let format = match format {
        Some(format) => format,
        None => ExportFormat::from_path(&path)?,
    };
    let filter = if only_processed {
        ItemFilter::Processed
    } else {
        ItemFilter::All
    };

    let max_retries = store
        .resolve_max_retries(run, None, DEFAULT_MAX_RETRIES)
        .await?;
    let items = store.items(run, filter, max_retries, None).await?;
    let written = export_to_path(&items, &schema, format, &path)?;
    println!("Exported {written} item(s) to {}", path.display());
    Ok(())
}
