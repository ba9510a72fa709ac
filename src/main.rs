mod cmd;
mod config;
mod error;
mod filetree;
mod inspector;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "layerpeek")]
#[command(about = "Resolve a container image into per-layer file trees")]
#[command(version)]
struct Cli {
    /// Container engine CLI to use (docker, podman, ...)
    #[arg(long, global = true)]
    engine: Option<String>,

    /// Output as JSON (optionally to a file)
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "-")]
    json: Option<String>,

    /// Export through an ephemeral local registry instead of `save`
    #[arg(long, global = true)]
    relay: bool,

    /// Maximum number of layers decompressed in parallel
    #[arg(long, short = 'j', global = true)]
    jobs: Option<usize>,

    /// Log debug output to stderr
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,

    /// Image reference or path to a tar archive (shorthand for `layerpeek inspect <image>`)
    image: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve an image and list its layers
    Inspect {
        /// Image reference or path to a tar archive
        image: String,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("LAYERPEEK_LOG")
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // `layerpeek <image>` is shorthand for `layerpeek inspect <image>`
    let image = match cli.command {
        Some(Commands::Inspect { image }) => image,
        None => match cli.image {
            Some(image) => image,
            None => {
                Cli::parse_from(["layerpeek", "--help"]);
                return Ok(());
            }
        },
    };

    let overrides = config::CliOverrides {
        engine: cli.engine,
        relay: cli.relay,
        jobs: cli.jobs,
    };
    cmd::inspect::run(&image, cli.json.as_deref(), overrides).await
}
