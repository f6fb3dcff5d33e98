use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
mod auth;
use backvault::{
    Backvault, CancelFlag, Config, Error, KdfParams, PipelineError, RunReport, list_archive,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "backvault")]
#[command(
    version,
    about = "Encrypted, password-protected backup archives for a directory tree."
)]
struct Cli {
    /// Path to the salt file
    #[arg(long, global = true, value_name = "PATH", env = "BACKVAULT_SALT")]
    salt: Option<PathBuf>,

    /// Directory for temporary staging areas (default: the output directory)
    #[arg(long, global = true, value_name = "DIR", env = "BACKVAULT_STAGING")]
    staging_dir: Option<PathBuf>,

    /// Number of encryption worker threads
    #[arg(long, global = true, env = "BACKVAULT_WORKERS")]
    workers: Option<usize>,

    /// scrypt cost exponent; archives only decrypt with the value they were made with
    #[arg(long, global = true, hide = true, env = "BACKVAULT_SCRYPT_LOG_N")]
    scrypt_log_n: Option<u8>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print the run report as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Creates the salt used for every archive
    Init,

    /// Encrypts a directory into a new backup archive
    Backup {
        /// Directory to back up
        #[arg(long, env = "BACKVAULT_SOURCE", default_value = "Data/Source")]
        source: PathBuf,

        /// Directory receiving the archive
        #[arg(long, env = "BACKVAULT_BACKUP_DIR", default_value = "Data/Backup")]
        backup_dir: PathBuf,
    },

    /// Decrypts a backup archive into a restored archive
    Restore {
        /// Archive path, or a file name inside the backup directory
        #[arg(long)]
        archive: PathBuf,

        /// Directory searched for bare archive names
        #[arg(long, env = "BACKVAULT_BACKUP_DIR", default_value = "Data/Backup")]
        backup_dir: PathBuf,

        /// Directory receiving the restored archive
        #[arg(long, env = "BACKVAULT_RESTORE_DIR", default_value = "Data/Restore")]
        restore_dir: PathBuf,
    },

    /// Lists the entries of an archive
    #[command(arg_required_else_help = true)]
    List { archive: PathBuf },
}

impl Cli {
    fn config(&self) -> Result<Config> {
        let mut config = match &self.salt {
            Some(path) => Config::with_salt_path(path.clone()),
            None => Config::default(),
        };
        config.staging_root = self.staging_dir.clone();
        config.workers = self.workers;
        if let Some(log_n) = self.scrypt_log_n {
            let default = KdfParams::default();
            config.kdf = KdfParams::new(log_n, default.r(), default.p())?;
        }
        Ok(config)
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn cancel_on_ctrl_c() -> CancelFlag {
    let cancel = CancelFlag::new();
    let handle = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handle.cancel()) {
        warn!("could not install Ctrl-C handler: {e}");
    }
    cancel
}

/// Bare names that do not exist as given are looked up in `backup_dir`.
fn resolve_archive(archive: &Path, backup_dir: &Path) -> PathBuf {
    let bare = archive.parent().is_none_or(|p| p.as_os_str().is_empty());
    if !archive.exists() && bare {
        backup_dir.join(archive)
    } else {
        archive.to_path_buf()
    }
}

fn print_report(report: &RunReport, json: bool, label: &str) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("{label}: {}", report.archive.display());
    for skipped in &report.skipped {
        println!("skipped {}: {}", skipped.name, skipped.reason);
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let config = cli.config()?;

    match &cli.command {
        Commands::Init => {
            let password = auth::read_new_password_with_confirmation()?;
            let session = Backvault::init(password, &config)?;
            info!(salt = ?session.salt(), "salt created");
            println!("salt initialized at {}", config.salt_path.display());
        }
        Commands::Backup { source, backup_dir } => {
            let password = auth::read_password()?;
            let session =
                Backvault::open_or_init(password, &config)?.with_cancel_flag(cancel_on_ctrl_c());
            let report = session.create_backup(source, backup_dir)?;
            print_report(&report, cli.json, "backup created")?;
        }
        Commands::Restore {
            archive,
            backup_dir,
            restore_dir,
        } => {
            let archive = resolve_archive(archive, backup_dir);
            let password = auth::read_password()?;
            let session =
                Backvault::open(password, &config)?.with_cancel_flag(cancel_on_ctrl_c());
            let report = session.restore_backup(&archive, restore_dir)?;
            if report.entries.is_empty() && report.is_partial() {
                warn!("no member of {} could be decrypted", archive.display());
            }
            print_report(&report, cli.json, "restored archive")?;
        }
        Commands::List { archive } => {
            let entries = list_archive(archive)
                .with_context(|| format!("cannot list {}", archive.display()))?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in entries {
                    println!("{entry}");
                }
            }
        }
    }

    Ok(())
}

fn exit_code(err: &anyhow::Error) -> u8 {
    let code = if let Some(e) = err.downcast_ref::<PipelineError>() {
        e.exit_code()
    } else if let Some(e) = err.downcast_ref::<Error>() {
        e.exit_code()
    } else {
        1
    };
    u8::try_from(code).unwrap_or(1)
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}
