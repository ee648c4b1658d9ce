//! Command-line interface.

use std::sync::Arc;

use clap::{Args, Parser, Subcommand};

use crate::boot::{BuildInfo, provision_secret};
use crate::bootstrap::DataPaths;
use crate::config::BootConfig;
use crate::server::auth::ConfigAuthenticator;
use crate::settings::{ConfigStore, JsonConfigStore};

#[derive(Parser, Debug)]
#[command(name = "fabhost")]
#[command(about = "Boot a CNC machine host and serve its web UI", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub run: RunArgs,
}

impl Cli {
    /// Flags for booting the engine, or `None` for a maintenance subcommand.
    pub fn run_args(&self) -> Option<&RunArgs> {
        match &self.command {
            None => Some(&self.run),
            Some(Command::Run(args)) => Some(args),
            Some(_) => None,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Boot the engine and serve the UI (the default)
    Run(RunArgs),

    /// Print build identity
    Version,

    /// Manage the session signing secret
    Secret {
        /// Delete the stored secret and generate a new one. Logs out every session.
        #[arg(long)]
        reset: bool,
    },

    /// Add a user or change a user's password
    Passwd {
        username: String,
        #[arg(long, env = "FABHOST_PASSWORD", hide_env_values = true)]
        password: String,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Fresh cache-busting token every boot and request logging
    #[arg(long)]
    pub debug: bool,

    /// Random 0-500 ms request latency (implies --debug)
    #[arg(long)]
    pub slow: bool,

    /// Attach the built-in simulated machine
    #[arg(long)]
    pub simulate: bool,

    /// HTTP port, overriding FABHOST_PORT and the stored server_port
    #[arg(long)]
    pub port: Option<u16>,
}

impl RunArgs {
    /// Layer command-line flags over the environment-derived config.
    pub fn apply(&self, config: &mut BootConfig) {
        config.debug.enabled |= self.debug || self.slow;
        config.debug.slow |= self.slow;
        config.simulate |= self.simulate;
        if self.port.is_some() {
            config.port_override = self.port;
        }
    }
}

pub fn print_version() {
    let build = BuildInfo::current(false);
    println!("fabhost {}", build.number);
    println!("  hash:  {}", build.hash.as_deref().unwrap_or("none"));
    println!("  type:  {}", build.kind.as_str());
    if let Some(identity) = build.identity() {
        println!("  token: {identity}");
    }
}

pub async fn reset_secret(config: &BootConfig) -> anyhow::Result<()> {
    let paths = DataPaths::new(&config.data_dir);
    let path = paths.auth_secret();
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    provision_secret(&path).await?;
    println!("New auth secret written to {}", path.display());
    Ok(())
}

pub async fn set_password(config: &BootConfig, username: &str, password: &str) -> anyhow::Result<()> {
    if username.trim().is_empty() {
        anyhow::bail!("username must not be empty");
    }
    let paths = DataPaths::new(&config.data_dir);
    let store: Arc<dyn ConfigStore> = Arc::new(JsonConfigStore::open(paths.engine_config()));
    ConfigAuthenticator::new(store)
        .set_password(username, password)
        .await?;
    println!("Password set for {username}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::USERS_KEY;
    use tempfile::tempdir;

    #[test]
    fn bare_invocation_runs() {
        let cli = Cli::try_parse_from(["fabhost", "--simulate", "--port", "8080"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.run.simulate);
        assert_eq!(cli.run.port, Some(8080));
    }

    #[test]
    fn maintenance_subcommands_skip_run_flags() {
        let cli = Cli::try_parse_from(["fabhost", "passwd", "admin", "--password", "x"]).unwrap();
        assert!(cli.run_args().is_none());
        let cli = Cli::try_parse_from(["fabhost", "secret", "--reset"]).unwrap();
        assert!(cli.run_args().is_none());
        let cli = Cli::try_parse_from(["fabhost", "run", "--debug"]).unwrap();
        assert!(cli.run_args().is_some_and(|args| args.debug));
    }

    #[test]
    fn slow_implies_debug() {
        let cli = Cli::try_parse_from(["fabhost", "run", "--slow"]).unwrap();
        let Some(Command::Run(args)) = cli.command else {
            panic!("expected run");
        };
        let mut config = BootConfig::for_data_dir("/tmp/fabhost-test");
        args.apply(&mut config);
        assert!(config.debug.enabled);
        assert!(config.debug.slow);
        assert_eq!(config.port_override, None);
    }

    #[tokio::test]
    async fn secret_reset_replaces_file() {
        let dir = tempdir().unwrap();
        let config = BootConfig::for_data_dir(dir.path());
        let path = DataPaths::new(dir.path()).auth_secret();

        reset_secret(&config).await.unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        reset_secret(&config).await.unwrap();
        let second = std::fs::read_to_string(&path).unwrap();

        assert_eq!(first.len(), 512);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn passwd_writes_digest() {
        let dir = tempdir().unwrap();
        let config = BootConfig::for_data_dir(dir.path());
        set_password(&config, "admin", "go2fab").await.unwrap();

        let store = JsonConfigStore::open(DataPaths::new(dir.path()).engine_config());
        let users = store.get(USERS_KEY).unwrap();
        assert!(crate::server::auth::verify_password(
            users["admin"].as_str().unwrap(),
            "go2fab"
        ));
    }
}
