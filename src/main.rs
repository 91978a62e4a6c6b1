//! tinyca - Minimal-footprint Certificate Authority
//!
//! Runs a root or subordinate authority over its drop folders: issues
//! pending requests, imports revocations and keeps the CRL current.
//!
//! # Quick Start
//!
//! ```bash
//! # Create the folder layout under ./store and ./work
//! tinyca --root-path . init-folders
//!
//! # First run creates the root authority, later runs drain the queues
//! TINY_PASSPHRASE='a long passphrase' tinyca --root-path . root
//!
//! # Create a key and request for a server, then inspect it
//! tinyca request app.example.com --dns www.example.com --ip 10.0.0.5
//! tinyca inspect app.example.com.csr
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{Input, Password};
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tinyca::configs::{self, Settings};
use tinyca::passphrase::{EnvPassphrase, Passphrase, PassphraseProvider, MIN_PASSPHRASE_LEN};
use tinyca::extensions::AltName;
use tinyca::private_key_storage::generate_key;
use tinyca::request::{self, sanitize_file_name, CertificateRequest};
use tinyca::runner::{self, AuthorityKind};
use tinyca::{AuthorityConfig, AuthorityError, Profile};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "tinyca", version, about = "Minimal-footprint certificate authority")]
struct Cli {
    /// TOML settings file
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Directory holding store/ and work/ (overrides settings)
    #[arg(long, global = true, env = "TINY_ROOT_PATH")]
    root_path: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run as root authority
    Root,
    /// Run as subordinate authority
    Sub,
    /// Create a P-384 key and a request for an end-entity certificate
    Request {
        /// Common name; prompted for when omitted
        common_name: Option<String>,
        /// DNS alternative name (repeatable)
        #[arg(long = "dns")]
        dns_names: Vec<String>,
        /// IP alternative name (repeatable)
        #[arg(long = "ip")]
        ip_addresses: Vec<IpAddr>,
        /// Email alternative name (repeatable)
        #[arg(long = "email")]
        email_addresses: Vec<String>,
        /// Directory for the key and request files
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Print a summary of a certificate request
    Inspect {
        /// PEM encoded PKCS#10 request
        file: PathBuf,
    },
    /// Create the store and work folder layout
    InitFolders,
}

/// Hidden terminal prompt, re-asked until the length policy is met.
struct PromptPassphrase;

impl PassphraseProvider for PromptPassphrase {
    fn passphrase(&self) -> tinyca::Result<Passphrase> {
        let input = Password::new()
            .with_prompt(format!("Enter passphrase [min {} characters]", MIN_PASSPHRASE_LEN))
            .validate_with(|input: &String| -> std::result::Result<(), String> {
                if input.len() < MIN_PASSPHRASE_LEN {
                    Err("You take security serious! Try again ...".to_string())
                } else {
                    Ok(())
                }
            })
            .interact()
            .map_err(|e| AuthorityError::Passphrase(format!("Failed to read passphrase: {}", e)))?;
        Passphrase::try_from(input)
    }
}

fn prompt(label: &str, default: &str) -> Result<String> {
    Input::<String>::new()
        .with_prompt(label)
        .default(default.to_string())
        .interact_text()
        .with_context(|| format!("Failed to read {}", label))
}

fn prompt_identity(kind: AuthorityKind) -> Result<AuthorityConfig> {
    println!("No setup configuration found, please enter the authority identity.");
    let default_name = match kind {
        AuthorityKind::Root => "Tiny PKI Root CA",
        AuthorityKind::Subordinate => "Tiny PKI Sub CA",
    };
    let mut config = AuthorityConfig::new(
        prompt("Common name", default_name)?,
        String::new(),
    );
    config.country_iso = prompt("Country ISO code", "US")?;
    config.organization = prompt("Organization", "Delete on error")?;
    config.organizational_unit = prompt("Organizational unit", "code monkeys")?;
    config.base_url = prompt("Base URL", "http://pki.example.com")?;
    Ok(config)
}

fn setup_identity(work: &Path, kind: AuthorityKind) -> Result<AuthorityConfig> {
    match configs::read_setup_config(work, kind)? {
        Some(config) => Ok(config),
        None => {
            warn!("{} not found in {}", configs::setup_file_name(kind), work.display());
            prompt_identity(kind)
        }
    }
}

fn run_authority(settings: &Settings, kind: AuthorityKind) -> Result<()> {
    let store = settings.store();
    store.setup_folders().context("Failed to create folders")?;
    let work = store.work_path().to_path_buf();

    let env_passphrase = EnvPassphrase::default();
    let passphrases: &dyn PassphraseProvider = if env_passphrase.is_available() {
        &env_passphrase
    } else {
        &PromptPassphrase
    };

    let summary = runner::run(
        store,
        kind,
        || setup_identity(&work, kind).map_err(|e| AuthorityError::config("Setup failed", format!("{:#}", e))),
        passphrases,
    )
    .with_context(|| format!("{} authority run failed", kind))?;

    if summary.awaiting_certificate {
        info!("Subordinate authority waits for its certificate");
        return Ok(());
    }
    info!(
        "Run complete: {} issued, {} rejected, {} failed, {} revoked",
        summary.issuance.issued, summary.issuance.rejected, summary.issuance.failed, summary.revoked
    );
    Ok(())
}

/// Comma separated list prompt, empty for none.
fn prompt_list(label: &str) -> Result<Vec<String>> {
    let answer = Input::<String>::new()
        .with_prompt(format!("{} (comma separated)", label))
        .allow_empty(true)
        .interact_text()
        .with_context(|| format!("Failed to read {}", label))?;
    Ok(answer
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect())
}

struct RequestIdentity {
    common_name: String,
    alt_names: Vec<AltName>,
}

fn prompt_request_identity() -> Result<RequestIdentity> {
    let common_name = prompt("Common name", "")?;
    let mut alt_names: Vec<AltName> = prompt_list("DNS names")?
        .into_iter()
        .map(AltName::Dns)
        .collect();
    for ip in prompt_list("IP addresses")? {
        let ip: IpAddr = ip
            .parse()
            .with_context(|| format!("'{}' is not an IP address", ip))?;
        alt_names.push(ip.into());
    }
    alt_names.extend(prompt_list("Email addresses")?.into_iter().map(AltName::Email));
    Ok(RequestIdentity { common_name, alt_names })
}

fn write_new(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    let mut file = options
        .open(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(data)
        .with_context(|| format!("Failed to write {}", path.display()))
}

fn create_request(identity: RequestIdentity, out: &Path) -> Result<()> {
    let file_stem = match sanitize_file_name(&identity.common_name) {
        stem if stem.is_empty() => "request".to_string(),
        stem => stem,
    };
    let key_path = out.join(format!("{}.key", file_stem));
    let csr_path = out.join(format!("{}.csr", file_stem));

    let key = generate_key().context("Failed to generate key")?;
    let csr = request::create_simple_request(&identity.common_name, &identity.alt_names, &key)
        .context("Failed to create request")?;
    let key_pem = key
        .private_key_to_pem_pkcs8()
        .context("Failed to encode private key")?;

    write_new(&key_path, &key_pem, 0o600)?;
    write_new(&csr_path, &csr, 0o644)?;
    warn!("Your private key is stored unencrypted at {}", key_path.display());
    info!("Your request is stored at {}", csr_path.display());
    Ok(())
}

fn inspect(file: &Path) -> Result<()> {
    let pem = fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let request = CertificateRequest::parse(&pem, Profile::Generic)
        .with_context(|| format!("{} is not a valid certificate request", file.display()))?;
    print!("{}", request.describe());
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let mut settings = match Settings::load(cli.settings.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{:#}", e);
            std::process::exit(2);
        }
    };
    if let Some(root_path) = cli.root_path {
        settings.root_path = Some(root_path);
    }

    let level = if cli.verbose { Level::DEBUG } else { settings.level() };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    let result = match cli.command {
        Command::Root => run_authority(&settings, AuthorityKind::Root),
        Command::Sub => run_authority(&settings, AuthorityKind::Subordinate),
        Command::Request {
            common_name,
            dns_names,
            ip_addresses,
            email_addresses,
            out,
        } => {
            let identity = match common_name {
                Some(common_name) => {
                    let mut alt_names: Vec<AltName> = dns_names.into_iter().map(AltName::Dns).collect();
                    alt_names.extend(ip_addresses.into_iter().map(AltName::from));
                    alt_names.extend(email_addresses.into_iter().map(AltName::Email));
                    Ok(RequestIdentity { common_name, alt_names })
                }
                None => prompt_request_identity(),
            };
            identity.and_then(|identity| create_request(identity, &out))
        }
        Command::Inspect { file } => inspect(&file),
        Command::InitFolders => settings
            .store()
            .setup_folders()
            .context("Failed to create folders"),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
