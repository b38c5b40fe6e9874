mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "nlmkit")]
#[command(about = "Sign in once, then drive notebook studio jobs from the terminal", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in through the browser and save the session to a profile
    Login {
        /// Profile name (defaults to the current default profile)
        #[arg(short, long)]
        profile: Option<String>,

        /// Overwrite a profile that belongs to a different account
        #[arg(long)]
        force: bool,

        /// Seconds to wait for sign-in (overrides config browser.loginTimeoutSecs)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Manage saved profiles
    Profiles {
        #[command(subcommand)]
        command: ProfilesCommands,
    },

    /// Invoke a raw batch operation and print its payload
    Call {
        /// Operation id (e.g. wXbhsf)
        operation_id: String,

        /// JSON parameters (e.g. '[null, 1]')
        params: String,

        /// Page path the call is made from
        #[arg(long, default_value = "/")]
        source_path: String,

        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Create and track studio artifacts
    Studio {
        #[command(subcommand)]
        command: StudioCommands,
    },
}

#[derive(Subcommand)]
enum ProfilesCommands {
    /// List saved profiles
    List,
    /// Make a profile the default
    Switch {
        /// Profile name
        name: String,
    },
    /// Show a profile's metadata (cookie values are never printed)
    Show {
        /// Profile name (defaults to the current default profile)
        name: Option<String>,
    },
}

#[derive(Subcommand)]
enum StudioCommands {
    /// Start generating an artifact
    Create {
        /// Notebook id
        #[arg(short, long)]
        notebook: String,

        /// audio, video, report, flashcards, quiz, mind-map, infographic, slide-deck, data-table
        #[arg(short, long)]
        kind: String,

        /// Source id to include (repeatable)
        #[arg(short, long = "source")]
        sources: Vec<String>,

        /// Kind-specific options as JSON
        #[arg(long)]
        options: Option<String>,

        /// Poll until the artifact completes or fails
        #[arg(short, long)]
        wait: bool,

        /// Seconds between polls when waiting
        #[arg(long, default_value = "10")]
        interval: u64,

        #[arg(short, long)]
        profile: Option<String>,
    },
    /// Refresh one artifact's status
    Poll {
        /// Artifact id
        artifact_id: String,

        /// Notebook id
        #[arg(short, long)]
        notebook: String,

        /// Poll until the artifact completes or fails
        #[arg(short, long)]
        wait: bool,

        /// Seconds between polls when waiting
        #[arg(long, default_value = "10")]
        interval: u64,

        #[arg(short, long)]
        profile: Option<String>,
    },
    /// List every artifact in a notebook
    Status {
        /// Notebook id
        #[arg(short, long)]
        notebook: String,

        #[arg(short, long)]
        profile: Option<String>,
    },
    /// Revise a slide deck into a new artifact
    Revise {
        /// Slide deck artifact id
        artifact_id: String,

        /// Notebook id
        #[arg(short, long)]
        notebook: String,

        /// Instruction as "<slide number>:<text>", slides numbered from 1 (repeatable)
        #[arg(short, long = "slide", required = true)]
        slides: Vec<String>,

        #[arg(short, long)]
        profile: Option<String>,
    },
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Login {
            profile,
            force,
            timeout,
        } => {
            commands::login::run(profile, force, timeout).await?;
        }
        Commands::Profiles { command } => match command {
            ProfilesCommands::List => {
                commands::profiles::list().await?;
            }
            ProfilesCommands::Switch { name } => {
                commands::profiles::switch(&name).await?;
            }
            ProfilesCommands::Show { name } => {
                commands::profiles::show(name).await?;
            }
        },
        Commands::Call {
            operation_id,
            params,
            source_path,
            profile,
        } => {
            commands::call::run(&operation_id, &params, &source_path, profile).await?;
        }
        Commands::Studio { command } => match command {
            StudioCommands::Create {
                notebook,
                kind,
                sources,
                options,
                wait,
                interval,
                profile,
            } => {
                commands::studio::create(
                    &notebook,
                    &kind,
                    sources,
                    options.as_deref(),
                    wait,
                    interval,
                    profile,
                )
                .await?;
            }
            StudioCommands::Poll {
                artifact_id,
                notebook,
                wait,
                interval,
                profile,
            } => {
                commands::studio::poll(&notebook, &artifact_id, wait, interval, profile).await?;
            }
            StudioCommands::Status { notebook, profile } => {
                commands::studio::status(&notebook, profile).await?;
            }
            StudioCommands::Revise {
                artifact_id,
                notebook,
                slides,
                profile,
            } => {
                commands::studio::revise(&notebook, &artifact_id, &slides, profile).await?;
            }
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Setup tracing; logs go to stderr so stdout stays machine-readable.
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        if let Some(hint) = e
            .downcast_ref::<nlmkit_core::Error>()
            .and_then(|err| err.hint())
        {
            eprintln!("Hint: {}", hint);
        }
        std::process::exit(1);
    }
}
