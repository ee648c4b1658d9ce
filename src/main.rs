use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use fabhost::boot::{BuildInfo, EngineState, Sequencer, Services};
use fabhost::bootstrap::load_fabhost_env;
use fabhost::cli::{self, Cli, Command};
use fabhost::config::BootConfig;

fn init_tracing(debug: bool) {
    let default_filter = if debug {
        "fabhost=debug,tower_http=debug"
    } else {
        "fabhost=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let json = std::env::var("FABHOST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    load_fabhost_env();

    let cli = Cli::parse();
    let mut config = BootConfig::resolve()?;
    if let Some(args) = cli.run_args() {
        args.apply(&mut config);
    }
    init_tracing(config.debug.enabled);

    match cli.command {
        None | Some(Command::Run(_)) => {}
        Some(Command::Version) => {
            cli::print_version();
            return Ok(());
        }
        Some(Command::Secret { reset }) => {
            if !reset {
                println!("Nothing to do. Use `fabhost secret --reset` to rotate the secret.");
                return Ok(());
            }
            return cli::reset_secret(&config).await;
        }
        Some(Command::Passwd { username, password }) => {
            return cli::set_password(&config, &username, &password).await;
        }
    }

    let build = BuildInfo::current(config.debug.enabled);
    tracing::info!(
        version = %build.number,
        hash = build.hash.as_deref().unwrap_or("none"),
        home = %config.data_dir.display(),
        "Starting fabhost"
    );

    let sequencer = Sequencer::standard().with_default_timeout(config.stage_timeout);
    let state = EngineState::new(build, Services::standard(config));
    let outcome = match sequencer.run(state).await {
        Ok(outcome) => outcome,
        Err(failure) => {
            tracing::error!(stage = failure.stage, "Engine failed to start: {}", failure.error);
            return Err(failure.into());
        }
    };

    for record in outcome.report.degraded() {
        tracing::warn!(stage = record.stage, "Running in degraded mode");
    }

    let mut state = outcome.state;
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    if let Some(listener) = state.listener.take() {
        listener.shutdown().await;
    }
    if let Some(machine) = state.machine.take() {
        machine.disconnect().await;
    }
    Ok(())
}
