//! PixelProbe command line, entry point.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing::{info, warn};

use pixelprobe::{
    events, find_chromium, ChromiumProvider, Coordinator, HttpClient, NoopProvider, RunOptions,
    RunResult, SessionProvider,
};
use pixelprobe_cli::config::{load_registry, load_sites, resolve_sites_path, SITES_FILE_ENV};
use pixelprobe_cli::{progress, report};

#[derive(Parser)]
#[command(
    name = "pixelprobe",
    about = "Audit storefronts for platform, analytics and tracking-pixel propagation",
    version,
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(flatten)]
    run: RunArgs,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Clone, Debug)]
struct RunArgs {
    /// Path to sites configuration file [default: $PIXELPROBE_SITES_FILE or sites.json].
    #[arg(long)]
    sites_file: Option<String>,

    /// Path to save analysis results.
    #[arg(long, default_value = "analysis_results.json")]
    output_file: PathBuf,

    /// Seconds to keep collecting requests after the page loads.
    #[arg(long, default_value_t = 5.0)]
    wait_time: f64,

    /// Hard per-site limit in seconds for live observation.
    #[arg(long, default_value_t = 30.0)]
    timeout: f64,

    /// Load pages but do not record their requests.
    #[arg(long)]
    no_intercept: bool,

    /// Perform static analysis only (no browser).
    #[arg(long)]
    static_only: bool,

    /// Sites analysed at once.
    #[arg(long, default_value_t = 2)]
    concurrency: usize,

    /// Skip fetching page markup for static analysis.
    #[arg(long)]
    no_fetch: bool,

    /// Append test alart/aleid values to URLs that carry neither.
    #[arg(long)]
    seed_params: bool,

    /// Signature document replacing the built-in set.
    #[arg(long)]
    signatures: Option<PathBuf>,

    /// Extra request regex counted as a custom pixel (repeatable).
    #[arg(long = "custom-pixel", value_name = "REGEX")]
    custom_pixels: Vec<String>,

    /// Print results as JSON instead of a table.
    #[arg(long)]
    json: bool,

    /// No progress bar.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyse every configured site (default).
    Run(RunArgs),

    /// Render a saved results file as a markdown matrix.
    Report {
        /// Path to analysis results file.
        #[arg(long, default_value = "analysis_results.json")]
        input_file: PathBuf,

        /// Path to output markdown file.
        #[arg(long, default_value = "matrix.md")]
        output_file: PathBuf,
    },

    /// Print the active signature set as JSON.
    Signatures {
        /// Signature document replacing the built-in set.
        #[arg(long)]
        signatures: Option<PathBuf>,

        /// Extra request regex counted as a custom pixel (repeatable).
        #[arg(long = "custom-pixel", value_name = "REGEX")]
        custom_pixels: Vec<String>,
    },

    /// Check that Chromium and the sites file are in place.
    Doctor,

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   pixelprobe completions bash > ~/.local/share/bash-completion/completions/pixelprobe
    ///   pixelprobe completions zsh > ~/.zfunc/_pixelprobe
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let command = cli.command.unwrap_or(Commands::Run(cli.run));
    let json = matches!(&command, Commands::Run(args) if args.json);

    if let Err(e) = dispatch(command).await {
        if json {
            println!("{}", serde_json::json!({ "error": format!("{e:#}") }));
        } else {
            eprintln!("Error: {e:#}");
        }
        std::process::exit(1);
    }
}

async fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Run(args) => run(args).await,

        Commands::Report {
            input_file,
            output_file,
        } => {
            let content = std::fs::read_to_string(&input_file).with_context(|| {
                format!(
                    "input file {} not found; run the analysis first",
                    input_file.display()
                )
            })?;
            let results: RunResult =
                serde_json::from_str(&content).context("results file is not valid")?;
            let matrix = report::render_matrix(&results, &chrono::Utc::now().to_rfc3339());
            write_file(&output_file, &matrix)?;
            println!("Matrix generated: {}", output_file.display());
            Ok(())
        }

        Commands::Signatures {
            signatures,
            custom_pixels,
        } => {
            let registry = load_registry(signatures.as_deref(), &custom_pixels)?;
            println!("{}", serde_json::to_string_pretty(registry.document())?);
            Ok(())
        }

        Commands::Doctor => {
            doctor();
            Ok(())
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "pixelprobe", &mut std::io::stdout());
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let sites_path = resolve_sites_path(args.sites_file.as_deref());
    let sites = load_sites(&sites_path)?;
    let registry = Arc::new(load_registry(args.signatures.as_deref(), &args.custom_pixels)?);

    let options = RunOptions {
        static_only: args.static_only,
        no_intercept: args.no_intercept,
        wait_seconds: args.wait_time,
        timeout_seconds: args.timeout,
        concurrency: args.concurrency,
        fetch_markup: !args.no_fetch,
        seed_tracking_params: args.seed_params,
    };
    options.validate()?;

    let chromium = if options.static_only {
        None
    } else {
        match ChromiumProvider::launch().await {
            Ok(provider) => Some(Arc::new(provider)),
            Err(e) => {
                warn!("{e:#}; live observation will fail for every site");
                None
            }
        }
    };
    let provider: Arc<dyn SessionProvider> = match &chromium {
        Some(provider) => Arc::clone(provider) as Arc<dyn SessionProvider>,
        None => Arc::new(NoopProvider),
    };

    let markup = Arc::new(HttpClient::new(Duration::from_secs_f64(options.timeout_seconds)));
    let mut coordinator = Coordinator::new(registry, markup, provider);

    let progress = if args.json || args.quiet {
        None
    } else {
        let (tx, rx) = events::channel();
        coordinator = coordinator.with_events(tx);
        Some(progress::spawn(rx))
    };

    info!(sites = sites.len(), file = %sites_path.display(), "loaded sites");
    let outcome = coordinator.run(&sites, &options).await;
    drop(coordinator);
    if let Some(handle) = progress {
        let _ = handle.await;
    }
    if let Some(provider) = chromium.and_then(|p| Arc::try_unwrap(p).ok()) {
        if let Err(e) = provider.shutdown().await {
            warn!("{e:#}");
        }
    }
    let results = outcome?;

    write_file(&args.output_file, &serde_json::to_string_pretty(&results)?)?;
    info!(path = %args.output_file.display(), "results written");

    if args.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        print!("{}", report::render_table(&results));
        println!(
            "\n{} sites, {} with errors. Results written to {}",
            results.len(),
            results.error_count(),
            args.output_file.display()
        );
    }
    Ok(())
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    std::fs::write(path, content).with_context(|| format!("cannot write {}", path.display()))
}

fn doctor() {
    println!("PixelProbe Doctor");
    println!("=================");
    println!();
    println!("OS:   {}", std::env::consts::OS);
    println!("Arch: {}", std::env::consts::ARCH);
    println!();

    let chromium = find_chromium();
    match &chromium {
        Some(path) => println!("[OK] Chromium found: {}", path.display()),
        None => println!(
            "[!!] Chromium NOT found. Install Chrome or set PIXELPROBE_CHROMIUM_PATH; \
             --static-only still works."
        ),
    }

    let sites_path = resolve_sites_path(None);
    match load_sites(&sites_path) {
        Ok(sites) => println!("[OK] {} lists {} sites", sites_path.display(), sites.len()),
        Err(e) => println!("[!!] {} ({SITES_FILE_ENV} overrides the path): {e}", sites_path.display()),
    }

    println!();
    if chromium.is_some() {
        println!("Status: READY");
    } else {
        println!("Status: STATIC ONLY");
    }
}
