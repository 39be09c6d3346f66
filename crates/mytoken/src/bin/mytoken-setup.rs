//! Provisioning for a mytoken server: signing key and database schema.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use mytoken::core::Keypair;
use mytoken::store::SqliteStore;
use mytoken::ServiceConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mytoken-setup", about = "Set up a mytoken server")]
struct Cli {
    /// Configuration file.
    #[arg(short, long, default_value = "mytoken.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate a new signing key and write it to the configured key file.
    SigningKey {
        /// Replace an existing key file.
        #[arg(long)]
        force: bool,
    },
    /// Create the database or bring its schema up to date.
    Db,
    /// Print the public keys of the configured signing key.
    Jwks,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = if cli.config.exists() {
        ServiceConfig::load(&cli.config)?
    } else {
        tracing::warn!(path = %cli.config.display(), "no configuration file, using defaults");
        ServiceConfig::default()
    };

    match cli.command {
        Command::SigningKey { force } => write_signing_key(&config.signing.key_file, force),
        Command::Db => {
            let path = &config.database.path;
            SqliteStore::open(path)
                .with_context(|| format!("migrating {}", path.display()))?;
            tracing::info!(path = %path.display(), "database schema is up to date");
            Ok(())
        }
        Command::Jwks => {
            let keys = config.load_key_ring()?;
            println!("{}", serde_json::to_string_pretty(&keys.jwks())?);
            Ok(())
        }
    }
}

fn write_signing_key(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists; pass --force to replace it", path.display());
    }
    let keypair = Keypair::generate();

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    writeln!(file, "{}", keypair.to_hex_seed())
        .with_context(|| format!("writing {}", path.display()))?;

    tracing::info!(
        path = %path.display(),
        kid = %keypair.public_key().kid(),
        "wrote signing key"
    );
    Ok(())
}
