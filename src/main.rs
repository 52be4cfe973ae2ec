use clap::{Parser, Subcommand, builder::styling};
use eyre::Result;
use jaffle_pipeline::{
    cli,
    client::Auth,
    config::PipelineConfig,
    etl::{ResourceStatus, RunOutcome},
};
use owo_colors::OwoColorize;
use std::path::PathBuf;
use std::process::ExitCode;

// CLI Styling
const STYLES: styling::Styles = styling::Styles::styled()
    .header(styling::AnsiColor::BrightWhite.on_default())
    .usage(styling::AnsiColor::BrightWhite.on_default())
    .literal(styling::AnsiColor::Green.on_default())
    .placeholder(styling::AnsiColor::Cyan.on_default());

/// Jaffle Pipeline: pull paginated REST resources into a local dataset
#[derive(Parser)]
#[command(name = "jaffle", version, styles = STYLES)]
struct Cli {
    /// The dotenv file to source configuration and credentials from
    #[arg(short, long, global = true, default_value = ".env")]
    env: String,

    /// More verbose logging
    #[arg(long, global = true)]
    debug: bool,

    /// Command to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract all resources and load them into the dataset
    Run {
        /// Only run these resources (repeatable)
        #[arg(short, long = "resource")]
        resources: Vec<String>,

        /// Number of concurrent extraction workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// YAML resources manifest (defaults to the Jaffle Shop resources)
        #[arg(short, long)]
        manifest: Option<PathBuf>,
    },

    /// Write the default resources manifest to start customizing
    Init {
        /// Manifest file to create
        #[arg(short, long, default_value = "resources.yml")]
        manifest: PathBuf,

        /// Overwrite an existing manifest
        #[arg(long)]
        force: bool,
    },

    /// List configured resources
    Resources {
        /// YAML resources manifest
        #[arg(short, long)]
        manifest: Option<PathBuf>,
    },

    /// Fetch the first page of each resource to verify the API is reachable
    Check {
        /// YAML resources manifest
        #[arg(short, long)]
        manifest: Option<PathBuf>,
    },

    /// Print the trace of the last run
    Trace,

    /// Print records loaded into a table
    Show {
        /// Table (resource) name
        table: String,

        /// Maximum number of records to print
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    if let Err(e) = dotenvy::from_filename(&cli.env)
        && !e.not_found()
    {
        return Err(e.into());
    }

    let log_level = match cli.debug {
        true => "debug",
        false => "info",
    };
    let env = env_logger::Env::default().filter_or("LOG_LEVEL", log_level);
    env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .init();

    let mut config = PipelineConfig::from_env()?;

    match cli.command {
        Commands::Run {
            resources,
            workers,
            manifest,
        } => {
            if let Some(workers) = workers {
                config = config.with_worker_count(workers);
            }
            let selected = cli::load_resources(manifest.as_deref())?.select(&resources)?;

            log::info!(
                "Running {} into {}",
                config.pipeline_name.cyan(),
                config.dataset_dir().display().bright_black()
            );
            let trace = cli::run_pipeline(&config, Auth::from_env(), &selected).await?;

            println!("{}", trace);
            let outcome = trace.outcome();
            match outcome {
                RunOutcome::Success => log::info!("{}", "✓ All resources loaded".green()),
                RunOutcome::Partial => log::warn!(
                    "Partial failure, failed resources: {}",
                    trace.failed().join(", ").red()
                ),
                RunOutcome::Failed => log::error!("{}", "All resources failed".red()),
            }
            return Ok(ExitCode::from(outcome.exit_code()));
        }
        Commands::Init { manifest, force } => {
            cli::init_manifest(&manifest, force)?;
            log::info!(
                "{} Edit {} and pass it with --manifest",
                "✓".green(),
                manifest.display().bright_black()
            );
        }
        Commands::Resources { manifest } => {
            let manifest = cli::load_resources(manifest.as_deref())?;
            for resource in &manifest.resources {
                println!(
                    "{:<16} {:<24} {:<8} {}",
                    resource.name.green(),
                    resource.path.bright_black(),
                    resource.write_policy.cyan(),
                    match resource.parallel_eligible {
                        true => "parallel",
                        false => "sequential",
                    }
                );
            }
        }
        Commands::Check { manifest } => {
            let manifest = cli::load_resources(manifest.as_deref())?;
            log::info!("Checking {}", config.base_url.as_str().bright_black());
            let results =
                cli::check_resources(&config, Auth::from_env(), &manifest.resources).await?;

            let mut failed = false;
            for (name, result) in results {
                match result {
                    Ok(count) => log::info!("✓ {}: {} record(s) on page 1", name.green(), count),
                    Err(e) => {
                        failed = true;
                        log::error!("✗ {}: {}", name.red(), e);
                    }
                }
            }
            if failed {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Trace => match cli::last_trace(&config)? {
            Some(trace) => {
                println!("{}", trace);
                for resource in &trace.resources {
                    if let ResourceStatus::Failed { kind, .. } = &resource.status {
                        log::warn!("{} failed with {}", resource.name.red(), kind);
                    }
                }
            }
            None => log::warn!(
                "No trace found in {}",
                config.dataset_dir().display().bright_black()
            ),
        },
        Commands::Show { table, limit } => {
            for record in cli::show_table(&config, &table, limit)? {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
