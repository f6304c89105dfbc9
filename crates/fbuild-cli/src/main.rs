use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;

use commands::{
    check::{handle_check_command, CheckArgs},
    config::{handle_config_command, ConfigCommands},
    identifier::handle_identifier_command,
    ios::{handle_ios_command, IosArgs},
};

#[derive(Parser)]
#[command(name = "fbuild")]
#[command(version = fbuild_core::VERSION)]
#[command(about = "Flutter release builds with ephemeral iOS signing credentials", long_about = None)]
struct Cli {
    /// Configuration profile to use
    #[arg(long, env = "FBUILD_PROFILE", global = true)]
    profile: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an IPA with temporary signing credentials
    Ios(IosArgs),

    /// Print the build identifier for a team/bundle pair
    Identifier {
        /// Apple developer team ID
        #[arg(long)]
        team_id: String,

        /// Bundle ID of the app
        #[arg(long, default_value = "")]
        bundle_id: String,

        /// Also print the derived file names, as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check a project and its signing material before building
    Check(CheckArgs),

    /// Manage CLI configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "fbuild=debug,fbuild_core=debug"
    } else {
        "fbuild=info,fbuild_core=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (doesn't override existing env vars)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Config(cmd) => handle_config_command(cmd),
        Commands::Identifier {
            team_id,
            bundle_id,
            json,
        } => handle_identifier_command(&team_id, &bundle_id, json),
        Commands::Ios(args) => {
            let material = resolve(cli.profile.as_deref(), &args.signing)?;
            handle_ios_command(args, material).await
        }
        Commands::Check(args) => {
            let material = resolve(cli.profile.as_deref(), &args.signing)?;
            handle_check_command(args, material).await
        }
    }
}

fn resolve(
    profile: Option<&str>,
    signing: &config::SigningArgs,
) -> Result<fbuild_core::models::SigningMaterial> {
    let file_config = config::load_config().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config file: {:#}", e);
        None
    });
    config::resolve_signing(profile, signing, file_config)
}
