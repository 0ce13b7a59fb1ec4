//! rigctl: operator CLI for the shared electrophysiology rig.
//!
//! Each invocation is short-lived. `start` takes the rig lock and exits; later
//! commands re-attach with the same token, so the lock (not this process)
//! decides who is driving the hardware.
//!
//! ## Subcommands
//!
//! - `status`, `maintenance`: inspect or toggle the lock record
//! - `register`: add or update an experiment token
//! - `start`, `stop`: take or release the rig
//! - `stim`, `upload`, `trigger`, `record`, `threshold`, `count`: session-gated hardware calls
//! - `best-stim`: show the stored best parameter for an electrode
//! - `uv`: fire the UV lamp

mod commands;
mod logging;

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rigctl")]
#[command(about = "Shared rig session and stimulation control")]
#[command(version)]
struct Cli {
    /// Config file (defaults to $NEURORIG_CONFIG or ~/.neurorig/rig.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Toggle {
    #[value(alias = "true")]
    On,
    #[value(alias = "false")]
    Off,
}

#[derive(Args)]
struct TokenArg {
    /// Experiment token
    #[arg(long)]
    token: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the lock record
    Status,

    /// Turn maintenance mode on or off
    Maintenance {
        #[arg(value_enum)]
        state: Toggle,
    },

    /// Register or update an experiment
    Register {
        #[arg(long)]
        token: String,
        /// Booking identity (email) the experiment runs under
        #[arg(long)]
        identity: String,
        #[arg(long)]
        name: String,
        /// Comma-separated electrode indices
        #[arg(long, value_delimiter = ',')]
        electrodes: Vec<u8>,
        /// Allow the experiment to take the rig
        #[arg(long)]
        can_run: bool,
    },

    /// Take the rig for an experiment
    Start(TokenArg),

    /// Release the rig
    Stop(TokenArg),

    /// Send one trigger frame (16 lines, e.g. 1000000000000001)
    Trigger {
        #[command(flatten)]
        token: TokenArg,
        #[arg(long)]
        pattern: String,
    },

    /// Edit and push stimulation parameters for one electrode
    Stim {
        #[command(flatten)]
        token: TokenArg,
        #[arg(long)]
        electrode: u8,
        /// field=value, repeatable (e.g. --set nb_pulse=3 --set polarity=PositiveFirst)
        #[arg(long = "set", value_name = "FIELD=VALUE")]
        edits: Vec<String>,
        /// Start from the stored best parameter for this electrode
        #[arg(long)]
        from_best: bool,
        /// Upload to the headstage after pushing
        #[arg(long)]
        upload: bool,
    },

    /// Upload staged stimulation parameters to the headstage
    Upload {
        #[command(flatten)]
        token: TokenArg,
        /// Comma-separated electrodes; all when omitted
        #[arg(long, value_delimiter = ',')]
        electrodes: Option<Vec<u8>>,
    },

    /// Start or stop recording
    Record {
        #[command(subcommand)]
        action: RecordAction,
    },

    /// Update spike-detection thresholds
    Threshold {
        #[command(subcommand)]
        kind: ThresholdKind,
    },

    /// Count spikes per channel
    Count {
        #[command(flatten)]
        token: TokenArg,
        #[arg(long, default_value_t = 1000)]
        duration_ms: u32,
    },

    /// Show the stored best stimulation parameter for an electrode
    BestStim {
        #[arg(long)]
        electrode: u8,
    },

    /// Fire the UV lamp
    Uv {
        #[arg(long)]
        duration: i32,
    },
}

#[derive(Subcommand)]
enum RecordAction {
    Start {
        #[command(flatten)]
        token: TokenArg,
        /// Comma-separated channels
        #[arg(long, value_delimiter = ',')]
        channels: Vec<u8>,
        #[arg(long)]
        tag: String,
        /// Record trigger lines alongside the signal
        #[arg(long)]
        triggers: bool,
    },
    Stop(TokenArg),
}

#[derive(Subcommand)]
enum ThresholdKind {
    /// Enable (or with --disable, disable) the variance threshold
    Var {
        #[command(flatten)]
        token: TokenArg,
        #[arg(long, value_delimiter = ',')]
        channels: Vec<u8>,
        #[arg(long)]
        disable: bool,
    },
    /// Set the coefficient threshold
    Coef {
        #[command(flatten)]
        token: TokenArg,
        #[arg(long, value_delimiter = ',')]
        channels: Vec<u8>,
        #[arg(long)]
        coef: f32,
    },
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        tracing::error!(error = %err, class = ?err.class(), "rigctl failed");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> neurorig_core::Result<()> {
    let ctx = commands::Context::load(cli.config)?;

    match cli.command {
        Commands::Status => commands::status(&ctx),
        Commands::Maintenance { state } => commands::maintenance(&ctx, state == Toggle::On),
        Commands::Register {
            token,
            identity,
            name,
            electrodes,
            can_run,
        } => commands::register(&ctx, token, identity, name, electrodes, can_run),
        Commands::Start(TokenArg { token }) => commands::start(&ctx, &token),
        Commands::Stop(TokenArg { token }) => commands::stop(&ctx, &token),
        Commands::Trigger { token, pattern } => commands::trigger(&ctx, &token.token, &pattern),
        Commands::Stim {
            token,
            electrode,
            edits,
            from_best,
            upload,
        } => commands::stim(&ctx, &token.token, electrode, &edits, from_best, upload),
        Commands::Upload { token, electrodes } => {
            commands::upload(&ctx, &token.token, electrodes.as_deref())
        }
        Commands::Record { action } => match action {
            RecordAction::Start {
                token,
                channels,
                tag,
                triggers,
            } => commands::record_start(&ctx, &token.token, &channels, &tag, triggers),
            RecordAction::Stop(TokenArg { token }) => commands::record_stop(&ctx, &token),
        },
        Commands::Threshold { kind } => match kind {
            ThresholdKind::Var {
                token,
                channels,
                disable,
            } => commands::threshold_var(&ctx, &token.token, &channels, !disable),
            ThresholdKind::Coef {
                token,
                channels,
                coef,
            } => commands::threshold_coef(&ctx, &token.token, &channels, coef),
        },
        Commands::Count { token, duration_ms } => commands::count(&ctx, &token.token, duration_ms),
        Commands::BestStim { electrode } => commands::best_stim(&ctx, electrode),
        Commands::Uv { duration } => commands::uv(&ctx, duration),
    }
}
