use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use campus_points::Engine;
use campus_points::auth::{self, CredentialGate, CredentialHasher, PinAttemptLimiter};
use campus_points::config::Config;
use campus_points::csv::write_wallets;
use campus_points::script::read_commands;
use campus_points::store::Store;

const USAGE: &str = "usage: campus-points [--config <file.toml>] [--migrate-legacy] <script.jsonl>";

struct Args {
    config: Option<PathBuf>,
    migrate_legacy: bool,
    script: PathBuf,
}

fn parse_args() -> Option<Args> {
    let mut config = None;
    let mut migrate_legacy = false;
    let mut script = None;
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config = Some(PathBuf::from(args.next()?)),
            "--migrate-legacy" => migrate_legacy = true,
            _ if script.is_none() => script = Some(PathBuf::from(arg)),
            _ => return None,
        }
    }
    Some(Args {
        config,
        migrate_legacy,
        script: script?,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let Some(args) = parse_args() else {
        eprintln!("{USAGE}");
        return ExitCode::from(2);
    };
    if args.script.extension().is_none_or(|ext| ext != "jsonl") {
        warn!(path = %args.script.display(), "input file seems to not be a jsonl script");
    }

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let store = match &config.journal_path {
        Some(path) => match Store::open(path) {
            Ok(store) => store,
            Err(e) => {
                error!(path = %path.display(), "{e}");
                return ExitCode::FAILURE;
            }
        },
        None => Store::in_memory(),
    };
    let store = Arc::new(store);

    let hasher = match CredentialHasher::new(&config.auth) {
        Ok(hasher) => hasher,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if args.migrate_legacy {
        match auth::migrate_legacy_credentials(&store, &hasher, Utc::now()) {
            Ok(users) => info!(users, "legacy credentials migrated"),
            Err(e) => {
                error!("{e}");
                return ExitCode::FAILURE;
            }
        }
    }

    let limiter = Arc::new(PinAttemptLimiter::new(&config.auth));
    let sweeper = limiter.spawn_sweeper(config.auth.sweep_interval());
    let gate = Arc::new(CredentialGate::new(store.clone(), hasher.clone(), limiter));
    let engine = Engine::new(store.clone(), gate, hasher, config);

    let commands = match read_commands(args.script.clone()) {
        Ok(commands) => commands,
        Err(e) => {
            error!(path = %args.script.display(), "{e}");
            return ExitCode::FAILURE;
        }
    };
    let (cmd_sender, cmd_receiver) = tokio::sync::mpsc::channel(16);

    tokio::spawn(async move {
        for result in commands {
            match result {
                Ok(command) => {
                    if cmd_sender.send(command).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    engine.run(ReceiverStream::new(cmd_receiver)).await;
    sweeper.abort();

    if let Err(e) = write_wallets(&store, std::io::stdout().lock()) {
        error!("failed to write wallets: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
