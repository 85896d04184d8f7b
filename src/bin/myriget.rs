use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;
use std::thread;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use myriget::config::{ConfigLoader, Settings};
use myriget::converter::{Converter, conversion_status};
use myriget::domain::{BatchMode, EntryFilter, ImportMode, LinkType};
use myriget::error::MyrigetError;
use myriget::events::{CancelToken, ChannelSink, LogSink, ProgressSink};
use myriget::library::{library_sizes, probe_missing_sizes};
use myriget::manifest::{self, CanonicalSchema};
use myriget::output::{
    ConsoleReporter, ConsoleSink, JsonOutput, OutputMode, print_run_text, print_sizes_text,
};
use myriget::scheduler::{ConvertRequest, RunRequest, Scheduler};
use myriget::transfer::{HttpClient, Transfer};

#[derive(Parser)]
#[command(name = "myriget")]
#[command(about = "Batch downloader that builds and maintains a local game library")]
#[command(version, author)]
struct Cli {
    /// Settings file (defaults to ./myriget.json when present)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Manifest to operate on instead of the configured links file
    #[arg(long, global = true)]
    manifest: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download, extract and publish manifest entries")]
    Run(RunArgs),
    #[command(about = "Build the manifest from a file of URLs, one per line")]
    Generate(GenerateArgs),
    #[command(about = "Import a manifest published at a URL")]
    Import(ImportArgs),
    #[command(about = "Merge a second manifest into the current one")]
    Merge(MergeArgs),
    #[command(about = "Add missing fields to every manifest entry")]
    Fix,
    #[command(about = "Clear pipeline or conversion state")]
    Reset(ResetArgs),
    #[command(about = "Summarize library size per link type")]
    Sizes(SizesArgs),
    #[command(about = "Convert every ISO in a directory to GOD format")]
    ConvertDir(ConvertDirArgs),
    #[command(about = "List converted games in the GOD output directory")]
    GodStatus(GodStatusArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    filter: Option<EntryFilter>,

    #[arg(long)]
    batch_mode: Option<BatchMode>,

    /// Entries per batch in count mode
    #[arg(long)]
    batch_size: Option<usize>,

    /// Total work cap in MB in size mode
    #[arg(long)]
    batch_size_mb: Option<u64>,

    /// Stop after this many entries (count mode)
    #[arg(long)]
    max_items: Option<usize>,

    /// Convert ISO entries to GOD after publishing
    #[arg(long)]
    convert: bool,

    /// Keep downloaded archives after a successful copy
    #[arg(long)]
    keep_downloads: bool,
}

#[derive(Args)]
struct GenerateArgs {
    /// Text file with one URL per line
    input: PathBuf,

    #[arg(long, default_value = "append")]
    mode: ImportMode,

    #[arg(long)]
    link_type: Option<LinkType>,
}

#[derive(Args)]
struct ImportArgs {
    url: String,

    #[arg(long, default_value = "append")]
    mode: ImportMode,
}

#[derive(Args)]
struct MergeArgs {
    secondary: PathBuf,
}

#[derive(Args)]
struct ResetArgs {
    /// Only reset the entry with this URL
    #[arg(long)]
    url: Option<String>,

    /// Clear conversion state instead of pipeline flags
    #[arg(long)]
    god: bool,
}

#[derive(Args)]
struct SizesArgs {
    /// Ask the server for sizes that are still unknown and save them
    #[arg(long)]
    probe: bool,
}

#[derive(Args)]
struct ConvertDirArgs {
    iso_dir: PathBuf,

    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long, default_value_t = 5)]
    batch_size: usize,
}

#[derive(Args)]
struct GodStatusArgs {
    dir: Option<PathBuf>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<MyrigetError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &MyrigetError) -> u8 {
    match error {
        MyrigetError::ManifestMissing(_)
        | MyrigetError::ManifestParse(_)
        | MyrigetError::ManifestSchema(_)
        | MyrigetError::MergeInputMissing(_)
        | MyrigetError::NothingToProcess
        | MyrigetError::ConfigRead(_)
        | MyrigetError::ConfigParse(_) => 2,
        MyrigetError::Http(_)
        | MyrigetError::HttpStatus { .. }
        | MyrigetError::ConverterUnavailable(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = ConfigLoader::resolve(cli.config.as_deref())?;
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };
    let manifest_path = cli
        .manifest
        .clone()
        .unwrap_or_else(|| settings.links_file.clone().into_std_path_buf());

    match cli.command {
        Commands::Run(args) => run_pipeline(args, settings, manifest_path, output_mode),
        Commands::Generate(args) => {
            let text = std::fs::read_to_string(&args.input)
                .map_err(|err| MyrigetError::Filesystem(format!("{}: {err}", args.input.display())))?;
            let urls: Vec<String> = text.lines().map(str::to_string).collect();
            let link_type = args.link_type.unwrap_or(settings.link_type);
            let report = manifest::process_urls(
                &manifest_path,
                &urls,
                args.mode,
                link_type,
                &ConsoleSink::new(),
            )?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_url_list(&report).into_diagnostic(),
                OutputMode::Text => {
                    println!(
                        "{} added, {} skipped, {} total",
                        report.added, report.skipped, report.total
                    );
                    Ok(())
                }
            }
        }
        Commands::Import(args) => {
            let client = HttpClient::new(settings.request_timeout())?;
            let count = manifest::import_from_url(
                &client,
                &args.url,
                &manifest_path,
                args.mode,
                &ConsoleSink::new(),
            )?;
            if matches!(output_mode, OutputMode::Json) {
                JsonOutput::print_json(&serde_json::json!({ "total": count })).into_diagnostic()?;
            }
            Ok(())
        }
        Commands::Merge(args) => {
            let report = manifest::merge(&manifest_path, &args.secondary)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_merge(&report).into_diagnostic(),
                OutputMode::Text => {
                    println!(
                        "Merged: {} added, {} duplicates, {} sizes updated, {} total",
                        report.added, report.duplicates, report.size_updates, report.total
                    );
                    Ok(())
                }
            }
        }
        Commands::Fix => {
            let changed =
                manifest::fix_missing_fields_file(&manifest_path, &CanonicalSchema::default())?;
            if changed {
                println!(
                    "Added missing fields; backup written to {}",
                    manifest::backup_path(&manifest_path).display()
                );
            } else {
                println!("All entries already have every field");
            }
            Ok(())
        }
        Commands::Reset(args) => {
            let mut entries = manifest::load(&manifest_path)?;
            let changed = if args.god {
                manifest::reset_god_status(&mut entries)
            } else {
                manifest::reset_pipeline_flags(&mut entries, args.url.as_deref())
            };
            manifest::save(&manifest_path, &entries)?;
            println!("Reset {changed} entries");
            Ok(())
        }
        Commands::Sizes(args) => {
            let mut entries = manifest::load(&manifest_path)?;
            if args.probe {
                let transfer = Transfer::new(HttpClient::new(settings.request_timeout())?);
                if probe_missing_sizes(&mut entries, &transfer, &ConsoleSink::new()) > 0 {
                    manifest::save(&manifest_path, &entries)?;
                }
            }
            let sizes = library_sizes(&entries);
            match output_mode {
                OutputMode::Json => JsonOutput::print_sizes(&sizes).into_diagnostic(),
                OutputMode::Text => {
                    print_sizes_text(&sizes);
                    Ok(())
                }
            }
        }
        Commands::ConvertDir(args) => {
            if !args.iso_dir.is_dir() {
                return Err(MyrigetError::IsoNotFound(args.iso_dir).into());
            }
            let converter = locate_converter(&settings)?;
            let output = args
                .output
                .unwrap_or_else(|| settings.god_output_dir.clone().into_std_path_buf());
            let report = converter.convert_directory(
                &args.iso_dir,
                &output,
                args.batch_size,
                &settings.convert_options(),
                &ConsoleSink::new(),
            );
            if !report.failed.is_empty() {
                for iso in &report.failed {
                    eprintln!("failed: {}", iso.display());
                }
            }
            Ok(())
        }
        Commands::GodStatus(args) => {
            let dir = args
                .dir
                .unwrap_or_else(|| settings.god_output_dir.clone().into_std_path_buf());
            let statuses = conversion_status(&dir);
            match output_mode {
                OutputMode::Json => JsonOutput::print_god_status(&statuses).into_diagnostic(),
                OutputMode::Text => {
                    for status in &statuses {
                        let mark = if status.converted { "converted" } else { "incomplete" };
                        println!("{:<40} {mark:<10} {} parts", status.name, status.file_count);
                    }
                    Ok(())
                }
            }
        }
    }
}

fn locate_converter(settings: &Settings) -> Result<Converter, MyrigetError> {
    let converter = match &settings.converter_path {
        Some(path) => Converter::with_program(path.as_std_path())?,
        None => Converter::locate(&settings.tool_dirs())?,
    };
    Ok(converter.with_idle_timeout(settings.converter_idle_timeout()))
}

fn run_pipeline(
    args: RunArgs,
    mut settings: Settings,
    manifest_path: PathBuf,
    output_mode: OutputMode,
) -> miette::Result<()> {
    if let Some(mode) = args.batch_mode {
        settings.batch_mode = mode;
    }
    if let Some(size) = args.batch_size {
        settings.batch_size = size;
    }
    if let Some(cap) = args.batch_size_mb {
        settings.batch_size_mb = cap;
    }
    let convert = args.convert || settings.convert_to_god;

    let transfer = Transfer::new(HttpClient::new(settings.request_timeout())?);
    let mut scheduler = Scheduler::new(transfer);
    if convert {
        scheduler = scheduler.with_converter(locate_converter(&settings)?);
    }

    let request = RunRequest {
        manifest_path,
        temp_dir: settings.temp_dir.clone().into_std_path_buf(),
        extract_dir: settings.temp_extract_dir.clone().into_std_path_buf(),
        output_dir: settings.output_dir.clone().into_std_path_buf(),
        policy: settings.batch_policy(args.max_items),
        filter: args.filter.unwrap_or(settings.filter_type),
        convert: if convert {
            ConvertRequest {
                enabled: true,
                god_output_dir: settings.god_output_dir.clone().into_std_path_buf(),
                options: settings.convert_options(),
            }
        } else {
            ConvertRequest::disabled()
        },
        keep_downloads: args.keep_downloads || !settings.delete_after_copy,
    };

    let (tx, rx) = mpsc::channel();
    let cancel = CancelToken::new();
    let worker = thread::spawn(move || {
        let sink = ChannelSink::new(tx);
        scheduler.run(&request, &sink, &cancel)
    });

    let mut reporter = ConsoleReporter::stdout();
    for event in rx {
        match output_mode {
            OutputMode::Text => reporter.handle(&event).into_diagnostic()?,
            OutputMode::Json => LogSink.event(event),
        }
    }

    let summary = worker
        .join()
        .map_err(|_| miette::Report::msg("worker thread panicked"))??;
    match output_mode {
        OutputMode::Json => JsonOutput::print_run(&summary).into_diagnostic(),
        OutputMode::Text => {
            print_run_text(&summary);
            Ok(())
        }
    }
}
