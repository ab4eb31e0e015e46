//! Main entry point for the webphone CLI
//!
//! Offline tools around webphone-core: filter an SDP file, classify ICE
//! candidate lines, or run a scripted registration and call against the
//! in-memory collaborators.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;
use webphone_core::PhoneConfig;

#[derive(Parser, Debug)]
#[command(name = "webphone", version, about = "SIP web phone core tools")]
struct Cli {
    /// JSON configuration file (absent fields take their defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Restrict the audio codecs of an SDP offer or answer
    FilterSdp {
        /// SDP file, `-` for stdin
        file: PathBuf,

        /// Comma separated codec allow-list, e.g. `pcmu,pcma`
        #[arg(short, long, value_delimiter = ',')]
        allow: Option<Vec<String>>,

        /// Keep telephone-event (DTMF)
        #[arg(long)]
        dtmf: bool,

        /// Treat the input as an answer
        #[arg(long)]
        answer: bool,
    },

    /// Classify ICE candidate lines
    Candidate {
        /// Raw `candidate:` lines
        #[arg(required = true)]
        lines: Vec<String>,

        /// Characters of the raw line kept in the report
        #[arg(long)]
        preview: Option<usize>,
    },

    /// Register and place one call against scripted collaborators
    Simulate {
        #[arg(long, default_value = "1001")]
        ext: String,

        #[arg(long, default_value = "secret")]
        password: String,

        #[arg(long, default_value = "example.com")]
        domain: String,

        /// WebSocket server (bare host or ws/wss URL); defaults to the domain
        #[arg(long, default_value = "")]
        server: String,

        /// Number to dial
        #[arg(long, default_value = "2002")]
        dial: String,

        /// How the far end behaves
        #[arg(long, value_enum, default_value_t = Outcome::Answer)]
        outcome: Outcome,

        /// Registrar answers with this rejection code instead of 200
        #[arg(long)]
        register_reject: Option<u16>,

        /// Seconds to stay in the call before hanging up
        #[arg(long, default_value_t = 5)]
        hold: u64,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Answer,
    Busy,
    Silent,
    InviteError,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<PhoneConfig> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            Ok(PhoneConfig::from_json_str(&text)?)
        }
        None => Ok(PhoneConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::FilterSdp {
            file,
            allow,
            dtmf,
            answer,
        } => commands::filter::execute(config, &file, allow, dtmf, answer),
        Command::Candidate { lines, preview } => {
            commands::candidate::execute(&config, &lines, preview);
            Ok(())
        }
        Command::Simulate {
            ext,
            password,
            domain,
            server,
            dial,
            outcome,
            register_reject,
            hold,
            json,
        } => {
            let run = commands::simulate::Run {
                ext,
                password,
                domain,
                server,
                dial,
                outcome,
                register_reject,
                hold: std::time::Duration::from_secs(hold),
                json,
            };
            commands::simulate::execute(config, run).await
        }
    }
}
