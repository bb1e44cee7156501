//! kvault: passphrase-protected secret and file vault
//!
//! Commands:
//!   status                          - storage paths, health and KDF settings
//!   config show                     - display current configuration
//!   secret set <key>                - encrypt a value read from stdin
//!   secret get <key>                - decrypt a value to stdout
//!   secret delete|exists <key>
//!   file upload <path>              - encrypt a file, print its blob name
//!   file download <name> [-o path]  - decrypt a blob to a file or stdout
//!   file delete|exists <name>
//!
//! The passphrase is read from KVAULT_PASSPHRASE or an interactive prompt,
//! never from the command line.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use zeroize::Zeroizing;

use kvault::{kdf_params_from_config, FileVault, Passphrase, SecretVault};
use kvault_core::config::{expand_tilde, KvaultConfig};
use kvault_core::WriteOutcome;
use kvault_storage::{check_blob_dir, FsBlobStore, JsonSecretStore};

const PASSPHRASE_ENV: &str = "KVAULT_PASSPHRASE";

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "kvault",
    version,
    about = "Passphrase-protected secret and file vault",
    long_about = "kvault: encrypt secrets and files at rest under a passphrase that is never stored"
)]
struct Cli {
    /// Path to kvault configuration file
    #[arg(
        long,
        short = 'c',
        env = "KVAULT_CONFIG",
        default_value = "~/.config/kvault/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "KVAULT_LOG")]
    log: Option<String>,

    /// Log format; overrides the config file
    #[arg(long, env = "KVAULT_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    fn from_config(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show storage locations, health and KDF settings
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Encrypted secrets
    Secret {
        #[command(subcommand)]
        action: SecretAction,
    },

    /// Encrypted files
    File {
        #[command(subcommand)]
        action: FileAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

#[derive(Subcommand, Debug)]
enum SecretAction {
    /// Store a secret; the value is read from stdin
    Set { key: String },
    /// Decrypt a secret and print it
    Get { key: String },
    /// Delete a secret
    Delete { key: String },
    /// Exit 0 if the secret exists, 1 otherwise
    Exists { key: String },
}

#[derive(Subcommand, Debug)]
enum FileAction {
    /// Encrypt a local file into the blob store and print its name
    Upload { path: PathBuf },
    /// Decrypt a stored file
    Download {
        name: String,
        /// Output path (default: stdout)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
    /// Delete a stored file
    Delete { name: String },
    /// Exit 0 if the stored file exists, 1 otherwise
    Exists { name: String },
}

// ── Entry point ────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let config = load_config(&config_path).await?;

    let level = cli
        .log
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| LogFormat::from_config(&config.logging.format));
    init_logging(&level, &format);

    if config.config_file_mode_check {
        check_config_mode(&config_path);
    }
    let config = config.resolve()?;

    match cli.command {
        Commands::Status => cmd_status(&config, &config_path).await,
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path),
        Commands::Secret { action } => cmd_secret(&config, action).await,
        Commands::File { action } => cmd_file(&config, action).await,
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries secret values and file contents; logs go to stderr.
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

async fn load_config(path: &Path) -> Result<KvaultConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        KvaultConfig::from_toml(&content)
            .with_context(|| format!("parsing config: {}", path.display()))
    } else {
        Ok(KvaultConfig::default())
    }
}

#[cfg(unix)]
fn check_config_mode(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(meta) = std::fs::metadata(path) {
        if meta.permissions().mode() & 0o004 != 0 {
            warn!(
                path = %path.display(),
                "config file is world-readable; consider chmod 600"
            );
        }
    }
}

#[cfg(not(unix))]
fn check_config_mode(_path: &Path) {}

// ── Passphrase and value input ─────────────────────────────────────────────────

/// Passphrase from KVAULT_PASSPHRASE, or an interactive no-echo prompt.
fn read_passphrase(confirm: bool) -> Result<Passphrase> {
    let raw = match std::env::var(PASSPHRASE_ENV) {
        Ok(value) => value,
        Err(_) => {
            let mut first = Zeroizing::new(
                rpassword::prompt_password("Passphrase: ").context("reading passphrase")?,
            );
            if confirm {
                let second = Zeroizing::new(
                    rpassword::prompt_password("Confirm passphrase: ")
                        .context("reading passphrase")?,
                );
                confirmed(first, second)?
            } else {
                std::mem::take(&mut *first)
            }
        }
    };
    Ok(kvault::passphrase(raw)?)
}

/// Match a prompted passphrase against its confirmation. Both prompt buffers
/// are wiped on either outcome.
fn confirmed(mut first: Zeroizing<String>, second: Zeroizing<String>) -> Result<String> {
    if *first != *second {
        anyhow::bail!("passphrases do not match");
    }
    Ok(std::mem::take(&mut *first))
}

async fn read_secret_value() -> Result<SecretString> {
    let mut raw = Zeroizing::new(String::new());
    tokio::io::stdin()
        .read_to_string(&mut raw)
        .await
        .context("reading secret value from stdin")?;
    Ok(SecretString::from(trim_line_ending(&raw).to_string()))
}

/// Drop one trailing newline, as left by `echo` or an interactive paste.
fn trim_line_ending(value: &str) -> &str {
    value
        .strip_suffix('\n')
        .map(|v| v.strip_suffix('\r').unwrap_or(v))
        .unwrap_or(value)
}

// ── `kvault status` / `kvault config show` ────────────────────────────────────

async fn cmd_status(config: &KvaultConfig, config_path: &Path) -> Result<()> {
    println!("kvault {}", env!("CARGO_PKG_VERSION"));
    if config_path.exists() {
        println!("  config:       {}", config_path.display());
    } else {
        println!("  config:       defaults (no file at {})", config_path.display());
    }

    let secrets = &config.storage.secrets_file;
    match JsonSecretStore::open(secrets).await {
        Ok(store) => println!(
            "  secrets:      {} ({} stored)",
            secrets.display(),
            store.len().await
        ),
        Err(e) => println!("  secrets:      {} (unreadable: {e})", secrets.display()),
    }

    let blobs = &config.storage.blob_dir;
    match check_blob_dir(blobs).await {
        Ok(()) => println!("  blobs:        {} (ok)", blobs.display()),
        Err(e) => println!("  blobs:        {} ({e})", blobs.display()),
    }

    println!("  kdf:          {:?}", kdf_params_from_config(&config.crypto));
    Ok(())
}

fn cmd_config_show(config: &KvaultConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!(
            "# Configuration: defaults (no file at {})",
            config_path.display()
        );
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── `kvault secret ...` ───────────────────────────────────────────────────────

async fn cmd_secret(config: &KvaultConfig, action: SecretAction) -> Result<()> {
    let store = JsonSecretStore::open(&config.storage.secrets_file)
        .await
        .with_context(|| {
            format!(
                "opening secret store: {}",
                config.storage.secrets_file.display()
            )
        })?;
    let vault = SecretVault::new(store, kdf_params_from_config(&config.crypto))?;

    match action {
        SecretAction::Set { key } => {
            let value = read_secret_value().await?;
            let passphrase = read_passphrase(true)?;
            let outcome = vault.set(&key, value, passphrase).await?;
            let verb = match outcome {
                WriteOutcome::Created => "created",
                WriteOutcome::Updated => "updated",
            };
            eprintln!("{key}: {verb}");
        }
        SecretAction::Get { key } => {
            let passphrase = read_passphrase(false)?;
            let value = vault.get(&key, passphrase).await?;
            println!("{}", value.expose_secret());
        }
        SecretAction::Delete { key } => {
            if !vault.delete(&key).await? {
                anyhow::bail!("secret not found: {key}");
            }
            eprintln!("{key}: deleted");
        }
        SecretAction::Exists { key } => {
            let exists = vault.exists(&key).await?;
            println!("{exists}");
            if !exists {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

// ── `kvault file ...` ─────────────────────────────────────────────────────────

async fn cmd_file(config: &KvaultConfig, action: FileAction) -> Result<()> {
    let store = FsBlobStore::open(&config.storage.blob_dir)
        .await
        .with_context(|| format!("opening blob store: {}", config.storage.blob_dir.display()))?;
    let vault = FileVault::new(store, kdf_params_from_config(&config.crypto))?;

    match action {
        FileAction::Upload { path } => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("opening {}", path.display()))?;
            let passphrase = read_passphrase(true)?;
            let name = vault.upload(file, passphrase).await?;
            info!(path = %path.display(), name = %name, "uploaded file");
            println!("{name}");
        }
        FileAction::Download { name, output } => {
            let passphrase = read_passphrase(false)?;
            match output {
                Some(path) => download_to_file(&vault, &name, passphrase, &path).await?,
                None => {
                    let mut stdout = tokio::io::stdout();
                    vault.download_to(&name, passphrase, &mut stdout).await?;
                }
            }
        }
        FileAction::Delete { name } => {
            if !vault.delete(&name).await? {
                anyhow::bail!("file not found: {name}");
            }
            eprintln!("{name}: deleted");
        }
        FileAction::Exists { name } => {
            let exists = vault.exists(&name).await?;
            println!("{exists}");
            if !exists {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

/// Decrypt into `path`, removing the output again if decryption fails part
/// way through.
async fn download_to_file(
    vault: &FileVault<FsBlobStore>,
    name: &str,
    passphrase: Passphrase,
    path: &Path,
) -> Result<()> {
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;
    match vault.download_to(name, passphrase, &mut file).await {
        Ok(bytes) => {
            info!(name = %name, path = %path.display(), bytes, "downloaded file");
            Ok(())
        }
        Err(e) => {
            drop(file);
            if let Err(rm) = tokio::fs::remove_file(path).await {
                warn!(path = %path.display(), "failed to remove partial output: {rm}");
            }
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_secret_set() {
        let cli = Cli::try_parse_from(["kvault", "secret", "set", "db-password"]).unwrap();
        match cli.command {
            Commands::Secret {
                action: SecretAction::Set { key },
            } => assert_eq!(key, "db-password"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_file_download_with_output() {
        let cli = Cli::try_parse_from([
            "kvault",
            "--log-format",
            "json",
            "file",
            "download",
            "abc",
            "-o",
            "/tmp/out.bin",
        ])
        .unwrap();
        assert_eq!(cli.log_format, Some(LogFormat::Json));
        match cli.command {
            Commands::File {
                action: FileAction::Download { name, output },
            } => {
                assert_eq!(name, "abc");
                assert_eq!(output, Some(PathBuf::from("/tmp/out.bin")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_passphrase_is_not_an_argument() {
        let result = Cli::try_parse_from(["kvault", "secret", "get", "k", "--passphrase", "x"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_confirmed_passphrase() {
        let matched = confirmed(
            Zeroizing::new("correct horse".to_string()),
            Zeroizing::new("correct horse".to_string()),
        )
        .unwrap();
        assert_eq!(matched, "correct horse");

        let mismatch = confirmed(
            Zeroizing::new("correct horse".to_string()),
            Zeroizing::new("battery staple".to_string()),
        );
        assert!(mismatch.is_err());
    }

    #[test]
    fn test_trim_line_ending() {
        assert_eq!(trim_line_ending("value\n"), "value");
        assert_eq!(trim_line_ending("value\r\n"), "value");
        assert_eq!(trim_line_ending("value\n\n"), "value\n");
        assert_eq!(trim_line_ending("value"), "value");
    }

    #[test]
    fn test_log_format_from_config() {
        assert_eq!(LogFormat::from_config("json"), LogFormat::Json);
        assert_eq!(LogFormat::from_config("text"), LogFormat::Text);
    }

    #[tokio::test]
    async fn test_load_config_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(config.crypto.pbkdf2_iterations, 100_000);
    }

    #[tokio::test]
    async fn test_load_config_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[crypto]\nkdf = \"argon2id\"\n").unwrap();
        let config = load_config(&path).await.unwrap();
        assert_eq!(
            config.crypto.kdf,
            kvault_core::config::KdfAlgorithm::Argon2id
        );
    }

    #[tokio::test]
    async fn test_load_config_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[crypto\n").unwrap();
        assert!(load_config(&path).await.is_err());
    }
}
