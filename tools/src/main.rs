use std::io;
use std::path::PathBuf;
use std::thread;

use clap::{ArgAction, Parser};
use log::LevelFilter;
use pack_core::{CancelToken, ErrorCategory, PackError, PackOptions, PackReport};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

const EXIT_SUCCESS: i32 = 0;
const EXIT_INTERNAL: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_ENVIRONMENT: i32 = 10;
const EXIT_PARSE: i32 = 11;
const EXIT_MISSING: i32 = 12;
const EXIT_IO: i32 = 13;
const EXIT_CANCELLED: i32 = 130;

#[derive(Parser)]
#[command(
    name = "mappack",
    version,
    about = "Packs a compiled Enemy Territory map and everything it references into a pk3"
)]
struct Cli {
    /// `<root>/maps/<name>.map` or `.bsp`.
    #[arg(value_name = "MAP")]
    map: PathBuf,

    /// Archive path, or a directory to place it in.
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Resolve everything and list the archive without writing it.
    #[arg(long)]
    dry_run: bool,

    /// Pack the map under a new name.
    #[arg(long, value_name = "NAME")]
    rename: Option<String>,

    /// Write the archive even when referenced files are missing.
    #[arg(long)]
    loose: bool,

    /// Also pack the .map source and editor-only images.
    #[arg(long)]
    include_source: bool,

    /// Only parse shader files listed in scripts/shaderlist.txt.
    #[arg(long)]
    shaderlist_only: bool,

    #[arg(long)]
    overwrite: bool,

    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Archive that is never scanned.
    #[arg(long, value_name = "PK3")]
    ignore: Vec<String>,

    /// Archive that is scanned but never packed.
    #[arg(long, value_name = "PK3")]
    exclude: Vec<String>,

    /// Archive the mod provides at runtime.
    #[arg(long = "mod", value_name = "PK3")]
    mod_provided: Vec<String>,

    /// TOML file with default options; flags override it.
    #[arg(long, value_name = "TOML")]
    config: Option<PathBuf>,

    /// Worker threads (0 = one per core, 1 = no pool).
    #[arg(long, value_name = "N")]
    jobs: Option<usize>,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);
    let exit_code = run_pack(cli);
    std::process::exit(exit_code);
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => LevelFilter::Error,
        (false, 0) => LevelFilter::Info,
        (false, 1) => LevelFilter::Debug,
        (false, _) => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .format_target(false)
        .parse_default_env()
        .init();
}

fn run_pack(cli: Cli) -> i32 {
    let options = match build_options(cli) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("{}", err);
            return exit_code(&err);
        }
    };
    let cancel = CancelToken::new();
    if let Err(err) = watch_signals(&cancel) {
        log::warn!("cannot watch for interrupts: {}", err);
    }
    match pack_core::run(&options, &cancel) {
        Ok(report) => {
            print_summary(&report);
            report_exit_code(&options, &report)
        }
        Err(err) => {
            eprintln!("mappack: {}", err);
            exit_code(&err)
        }
    }
}

/// The first SIGINT/SIGTERM cancels the run so the partial archive is
/// removed; a second one exits at once.
fn watch_signals(cancel: &CancelToken) -> io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let cancel = cancel.clone();
    thread::spawn(move || {
        for signal in signals.forever() {
            if cancel.is_cancelled() {
                std::process::exit(EXIT_CANCELLED);
            }
            log::warn!("received signal {}, cancelling", signal);
            cancel.cancel();
        }
    });
    Ok(())
}

fn build_options(cli: Cli) -> Result<PackOptions, PackError> {
    let mut options = match &cli.config {
        Some(path) => PackOptions::load_toml(path)?,
        None => PackOptions::default(),
    };
    options.map = cli.map;
    if cli.output.is_some() {
        options.output = cli.output;
    }
    if cli.rename.is_some() {
        options.rename = cli.rename;
    }
    if let Some(jobs) = cli.jobs {
        options.jobs = jobs;
    }
    options.dry_run |= cli.dry_run;
    options.loose |= cli.loose;
    options.include_source |= cli.include_source;
    options.shaderlist_only |= cli.shaderlist_only;
    options.overwrite |= cli.overwrite;
    options.ignore.extend(cli.ignore);
    options.exclude.extend(cli.exclude);
    options.mod_provided.extend(cli.mod_provided);
    Ok(options)
}

fn exit_code(err: &PackError) -> i32 {
    match err.category() {
        ErrorCategory::Usage => EXIT_USAGE,
        ErrorCategory::Environment => EXIT_ENVIRONMENT,
        ErrorCategory::Parse => EXIT_PARSE,
        ErrorCategory::Missing => EXIT_MISSING,
        ErrorCategory::Io => EXIT_IO,
        ErrorCategory::Cancelled => EXIT_CANCELLED,
        ErrorCategory::Internal => EXIT_INTERNAL,
    }
}

/// A strict run that had to skip unreadable files still fails.
fn report_exit_code(options: &PackOptions, report: &PackReport) -> i32 {
    if !options.loose && !report.io_failures.is_empty() {
        EXIT_IO
    } else {
        EXIT_SUCCESS
    }
}

fn print_summary(report: &PackReport) {
    match &report.output {
        Some(path) => println!("wrote {} ({} files)", path.display(), report.entries.len()),
        None => {
            for name in &report.entries {
                println!("{}", name);
            }
            println!("dry run: {} files would be packed", report.entries.len());
        }
    }
    println!(
        "shaders included: {}, already shipped: {}",
        report.included_shaders, report.skipped_not_packed
    );
    if !report.missing.is_empty() {
        println!("missing: {}", report.missing.len());
        for missing in &report.missing {
            println!("  {} ({})", missing.name, missing.origin);
        }
    }
    if !report.io_failures.is_empty() {
        println!("read failures: {}", report.io_failures.len());
        for failure in &report.io_failures {
            println!("  {}", failure);
        }
    }
    if !report.conflicts.is_empty() {
        println!("shader conflicts: {}", report.conflicts.len());
    }
    if !report.warnings.is_empty() {
        println!("warnings: {}", report.warnings.len());
    }
}
