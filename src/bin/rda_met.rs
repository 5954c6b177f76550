use std::process::ExitCode;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rda_met::app::{App, FetchOptions};
use rda_met::config::{ConfigLoader, PipelineConfig};
use rda_met::domain::{BoundingBox, Credentials, DatasetQuery, parse_timestamp};
use rda_met::download::HttpDownloader;
use rda_met::error::RdaError;
use rda_met::output::{ConsoleProgress, JsonOutput, OutputMode, print_fetch_summary};
use rda_met::poll::CancelToken;
use rda_met::rda::RdaHttpClient;
use rda_met::store::Store;

#[derive(Parser)]
#[command(name = "rda-met")]
#[command(about = "Download meteorological datasets from the NCAR Research Data Archive")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true)]
    base_dir: Option<Utf8PathBuf>,

    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Submit a request, wait for it and download the result")]
    Fetch(FetchArgs),
    #[command(about = "Print where a dataset is stored and whether it is present")]
    Path(QueryArgs),
}

#[derive(Args, Clone)]
struct QueryArgs {
    #[arg(long)]
    dataset: String,

    #[arg(long)]
    product: String,

    /// Parameter name; repeat for several (names may contain spaces, e.g. "V GRD").
    #[arg(long = "param", required = true)]
    params: Vec<String>,

    /// YYYYMMDDHHMM
    #[arg(long)]
    start: String,

    /// YYYYMMDDHHMM
    #[arg(long)]
    end: String,

    /// south,north,west,east
    #[arg(long, allow_hyphen_values = true)]
    bbox: String,
}

#[derive(Args, Clone)]
struct FetchArgs {
    #[command(flatten)]
    query: QueryArgs,

    #[arg(long)]
    force: bool,

    /// Give up (and purge the request) after this many minutes.
    #[arg(long)]
    timeout_minutes: Option<u64>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<RdaError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &RdaError) -> u8 {
    if error.is_user_error() {
        2
    } else if error.is_remote_error() {
        3
    } else {
        1
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let store = match cli.base_dir {
        Some(base_dir) => Store::new_with_base(base_dir),
        None => Store::new()?,
    };

    match cli.command {
        Commands::Fetch(args) => run_fetch(args, store, config, output_mode),
        Commands::Path(args) => run_path(args, store, config, output_mode),
    }
}

fn build_query(args: &QueryArgs) -> Result<DatasetQuery, RdaError> {
    DatasetQuery::new(
        args.dataset.as_str(),
        args.product.as_str(),
        args.params.clone(),
        parse_timestamp(&args.start)?,
        parse_timestamp(&args.end)?,
        args.bbox.parse::<BoundingBox>()?,
    )
}

fn build_app(
    store: Store,
    config: PipelineConfig,
) -> Result<App<RdaHttpClient, HttpDownloader>, RdaError> {
    let client = RdaHttpClient::new(&config)?;
    let downloader = HttpDownloader::new(&config);
    Ok(App::new(store, client, downloader, config))
}

fn run_fetch(
    args: FetchArgs,
    store: Store,
    config: PipelineConfig,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let query = build_query(&args.query)?;
    let credentials = Credentials::from_env()?;
    let app = build_app(store, config)?;

    let mut cancel = CancelToken::new();
    if let Some(minutes) = args.timeout_minutes {
        cancel = cancel.with_deadline(Instant::now() + Duration::from_secs(minutes * 60));
    }
    cancel_on_interrupt(&cancel);
    let options = FetchOptions { force: args.force };

    match output_mode {
        OutputMode::Json => {
            let result = app.fetch(&query, &credentials, &options, &JsonOutput, &cancel)?;
            JsonOutput::print_fetch(&result).into_diagnostic()?;
        }
        OutputMode::Human => {
            let sink = ConsoleProgress::new();
            let result = app.fetch(&query, &credentials, &options, &sink, &cancel)?;
            print_fetch_summary(&result);
        }
    }
    Ok(())
}

fn cancel_on_interrupt(cancel: &CancelToken) {
    let cancel = cancel.clone();
    let spawned = std::thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    warn!(error = %err, "could not start the Ctrl-C listener");
                    return;
                }
            };
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_err() {
                    warn!("could not register the Ctrl-C handler");
                    return;
                }
                info!("interrupted, purging the request before exiting");
                cancel.cancel();
                // A second interrupt skips the purge.
                if tokio::signal::ctrl_c().await.is_ok() {
                    std::process::exit(130);
                }
            });
        });
    if let Err(err) = spawned {
        warn!(error = %err, "could not start the Ctrl-C listener");
    }
}

fn run_path(
    args: QueryArgs,
    store: Store,
    config: PipelineConfig,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let query = build_query(&args)?;
    let app = build_app(store, config)?;
    let result = app.path(&query)?;
    match output_mode {
        OutputMode::Json => JsonOutput::print_path(&result).into_diagnostic()?,
        OutputMode::Human => {
            let state = if result.downloaded {
                "downloaded"
            } else {
                "missing"
            };
            println!("{} ({state})", result.path);
        }
    }
    Ok(())
}
