//! Command-line front end over `ssm_core`.
//!
//! Every command except `audit tail` runs against one [`SecretManager`] and leaves exactly one
//! signed audit entry behind, success or failure. Output goes to the writer handed to
//! [`execute`], so the binary prints to stdout and tests capture a buffer.

use std::{fs, io::Write, path::PathBuf, time::Instant};

use anyhow::{anyhow, bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use ssm_core::{
    jwt, labels, verify_audit_entry, Algorithm, AuditEntry, Claims, FileAuditSink, KeyDirectory,
    KeyInfo, KeyLifecycle, KeyType, SealedSecret, SecretBytes, SecretManager, SsmConfig,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "ssm",
    author,
    version,
    about = "Operator CLI for the SSM token engine",
    propagate_version = true
)]
pub struct Cli {
    /// TOML configuration file. Without it, settings come from SSM_* variables.
    #[arg(long, env = "SSM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Bootstrap the token and report session and login state.
    Health,
    /// Show session pool occupancy.
    Stats,
    /// List the mechanisms the slot advertises.
    Mechanisms,
    /// Manage symmetric keys.
    Keys {
        #[command(subcommand)]
        action: KeyCommands,
    },
    /// Encrypt hex plaintext and print the sealed record as JSON.
    Encrypt {
        #[arg(long)]
        label: String,
        /// Key identifier; a random key under the label when omitted.
        #[arg(long)]
        id: Option<u32>,
        #[arg(long, value_enum, default_value_t = AlgorithmArg::Aes)]
        algorithm: AlgorithmArg,
        plaintext_hex: String,
    },
    /// Decrypt a sealed record (JSON string or @file) and print the plaintext as hex.
    Decrypt { sealed: String },
    /// Issue and check access tokens.
    Jwt {
        #[command(subcommand)]
        action: JwtCommands,
    },
    /// Inspect the audit log.
    Audit {
        #[command(subcommand)]
        action: AuditCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum KeyCommands {
    /// List keys, optionally under a single label.
    List {
        #[arg(long)]
        label: Option<String>,
    },
    /// Generate a key in the token.
    Generate(GenerateArgs),
    /// Import raw key bytes under an external label.
    Store(ImportArgs),
    /// Replace the key material at (label, id).
    Update(ImportArgs),
    /// Destroy the key at (label, id).
    Delete {
        #[arg(long)]
        label: String,
        #[arg(long)]
        id: u32,
    },
    /// Destroy every secret key on the token.
    DeleteAll {
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// Algorithm code 1-8 selecting label, key type and size.
    #[arg(long, conflicts_with_all = ["label", "bits"])]
    pub code: Option<u8>,
    #[arg(long, required_unless_present = "code")]
    pub label: Option<String>,
    #[arg(long)]
    pub bits: Option<u32>,
    /// Identifier; the next free one when omitted or 0.
    #[arg(long)]
    pub id: Option<u32>,
}

#[derive(Args, Debug)]
pub struct ImportArgs {
    #[arg(long)]
    pub label: String,
    #[arg(long, default_value_t = 0)]
    pub id: u32,
    /// Raw key bytes, hex encoded.
    #[arg(long, env = "SSM_KEY_HEX", hide_env_values = true)]
    pub key_hex: String,
}

#[derive(Subcommand, Debug)]
pub enum JwtCommands {
    Sign {
        #[arg(long)]
        subject: String,
        #[arg(long)]
        audience: Option<String>,
        #[arg(long, default_value_t = 86_400)]
        ttl_secs: i64,
    },
    Verify { token: String },
}

#[derive(Subcommand, Debug)]
pub enum AuditCommands {
    /// Print the newest entries with their signature status.
    Tail {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum AlgorithmArg {
    Aes,
    Des,
    Des3,
    AesGcm,
}

impl From<AlgorithmArg> for Algorithm {
    fn from(value: AlgorithmArg) -> Algorithm {
        match value {
            AlgorithmArg::Aes => Algorithm::Aes,
            AlgorithmArg::Des => Algorithm::Des,
            AlgorithmArg::Des3 => Algorithm::Des3,
            AlgorithmArg::AesGcm => Algorithm::AesGcm,
        }
    }
}

#[derive(Serialize)]
struct KeyView<'a> {
    #[serde(flatten)]
    info: &'a KeyInfo,
    created: bool,
}

pub fn init_tracing(json: bool) {
    let (plain, structured) = if json {
        (None, Some(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)))
    } else {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            ),
            None,
        )
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(plain)
        .with(structured)
        .init();
}

pub fn load_config(cli: &Cli) -> anyhow::Result<SsmConfig> {
    match &cli.config {
        Some(path) => SsmConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => SsmConfig::from_env().context("reading configuration from SSM_* variables"),
    }
}

fn print_json<T: Serialize>(out: &mut dyn Write, value: &T) -> anyhow::Result<()> {
    writeln!(out, "{}", serde_json::to_string_pretty(value)?)?;
    Ok(())
}

/// The service route each command stands in for, so audit actions resolve the same way.
pub fn audit_route(command: &Commands) -> (&'static str, &'static str) {
    match command {
        Commands::Health => ("POST", "/crypto/health-check"),
        Commands::Stats | Commands::Mechanisms => ("GET", "/cli/status"),
        Commands::Keys { action } => match action {
            KeyCommands::List { label: Some(_) } => ("POST", "/crypto/get-data-keys"),
            KeyCommands::List { label: None } => ("POST", "/crypto/get-all-keys"),
            KeyCommands::Generate(args) => match generate_target(args) {
                Ok((_, key_type, _)) => ("POST", generate_route(key_type)),
                Err(_) => ("POST", "/crypto/generate-aes-key"),
            },
            KeyCommands::Store(_) => ("POST", "/crypto/store-key"),
            KeyCommands::Update(_) => ("PUT", "/crypto/store-key"),
            KeyCommands::Delete { .. } | KeyCommands::DeleteAll { .. } => {
                ("DELETE", "/crypto/store-key")
            }
        },
        Commands::Encrypt { .. } => ("POST", "/crypto/encrypt"),
        Commands::Decrypt { .. } => ("POST", "/crypto/decrypt"),
        Commands::Jwt { .. } => ("POST", "/login"),
        Commands::Audit { .. } => ("GET", "/cli/audit"),
    }
}

fn generate_route(key_type: KeyType) -> &'static str {
    match key_type {
        KeyType::Aes => "/crypto/generate-aes-key",
        KeyType::Des => "/crypto/generate-des-key",
        KeyType::Des3 => "/crypto/generate-des3-key",
    }
}

/// Run `command` and record one audit entry with its outcome.
pub fn execute(
    manager: &SecretManager,
    command: &Commands,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let (method, path) = audit_route(command);
    let entry = AuditEntry::new(method, path, "local").with_user_agent(concat!(
        "ssm-cli/",
        env!("CARGO_PKG_VERSION")
    ));
    let started = Instant::now();
    let result = run(manager, command, out);
    let (status, error) = match &result {
        Ok(()) => (200, None),
        Err(err) => (500, Some(format!("{err:#}"))),
    };
    manager.record_audit(entry.finish(status, started.elapsed(), error));
    result
}

fn run(manager: &SecretManager, command: &Commands, out: &mut dyn Write) -> anyhow::Result<()> {
    match command {
        Commands::Health => print_json(out, &manager.health()?),
        Commands::Stats => print_json(out, &manager.stats()),
        Commands::Mechanisms => {
            for mechanism in manager.pool().token().mechanisms()? {
                writeln!(out, "{mechanism}")?;
            }
            Ok(())
        }
        Commands::Keys { action } => run_keys(manager, action, out),
        Commands::Encrypt {
            label,
            id,
            algorithm,
            plaintext_hex,
        } => {
            let mut plaintext = SecretBytes::new(
                hex::decode(plaintext_hex).context("plaintext must be hex encoded")?,
            );
            let sealed = manager.encrypt(label, *id, (*algorithm).into(), plaintext.expose_mut())?;
            print_json(out, &sealed)
        }
        Commands::Decrypt { sealed } => {
            let raw = match sealed.strip_prefix('@') {
                Some(file) => fs::read_to_string(file).with_context(|| format!("reading {file}"))?,
                None => sealed.clone(),
            };
            let sealed: SealedSecret =
                serde_json::from_str(&raw).context("sealed record is not valid JSON")?;
            let plaintext = manager.decrypt(&sealed)?;
            writeln!(out, "{}", hex::encode(plaintext.expose()))?;
            Ok(())
        }
        Commands::Jwt { action } => match action {
            JwtCommands::Sign {
                subject,
                audience,
                ttl_secs,
            } => {
                let mut claims =
                    Claims::new(subject.as_str()).expires_in(time::Duration::seconds(*ttl_secs));
                if let Some(audience) = audience {
                    claims = claims.with_audience(audience.as_str());
                }
                writeln!(out, "{}", manager.sign_jwt(&claims)?)?;
                Ok(())
            }
            JwtCommands::Verify { token } => {
                let claims = jwt::verify_jwt(manager.signing_keys(), token)?;
                print_json(out, &claims)
            }
        },
        Commands::Audit { .. } => bail!("audit commands read the log without a running manager"),
    }
}

/// Resolve a generate request to (label, key type, bits), enforcing the label whitelists.
fn generate_target(args: &GenerateArgs) -> anyhow::Result<(String, KeyType, Option<u32>)> {
    if let Some(code) = args.code {
        let entry = labels::algorithm_code(code)
            .ok_or_else(|| anyhow!("unknown algorithm code {code}; expected 1-8"))?;
        return Ok((entry.label.to_string(), entry.key_type, Some(entry.bits)));
    }
    let label = args
        .label
        .as_deref()
        .ok_or_else(|| anyhow!("either --code or --label is required"))?;
    let key_type = labels::key_type_for_label(label)
        .ok_or_else(|| anyhow!("{label} is not a managed key label"))?;
    Ok((label.to_string(), key_type, args.bits))
}

fn external_key_type(label: &str) -> anyhow::Result<KeyType> {
    if !labels::is_external_label(label) {
        bail!(
            "{label} is not an external key label; expected one of {}",
            labels::EXTERNAL_LABELS.join(", ")
        );
    }
    labels::key_type_for_label(label).ok_or_else(|| anyhow!("{label} has no key type"))
}

fn decode_key(key_hex: &str) -> anyhow::Result<SecretBytes> {
    Ok(SecretBytes::new(hex::decode(key_hex).context("key must be hex encoded")?))
}

fn run_keys(
    manager: &SecretManager,
    action: &KeyCommands,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let session = manager.acquire()?;
    let lifecycle = KeyLifecycle::new(&session);
    match action {
        KeyCommands::List { label } => {
            let directory = KeyDirectory::new(&session);
            let infos: Vec<KeyInfo> = match label {
                Some(label) => directory
                    .find_keys_by_label(label)?
                    .iter()
                    .map(|key| key.info().clone())
                    .collect(),
                None => directory
                    .find_all_keys()?
                    .values()
                    .flatten()
                    .map(|key| key.info().clone())
                    .collect(),
            };
            print_json(out, &infos)
        }
        KeyCommands::Generate(args) => {
            let (label, key_type, bits) = generate_target(args)?;
            let outcome = lifecycle.generate(key_type, &label, args.id, bits)?;
            print_json(
                out,
                &KeyView {
                    info: outcome.key.info(),
                    created: outcome.is_created(),
                },
            )
        }
        KeyCommands::Store(args) => {
            let key_type = external_key_type(&args.label)?;
            let key = decode_key(&args.key_hex)?;
            let outcome = lifecycle.store(&args.label, &key, args.id, key_type)?;
            print_json(
                out,
                &KeyView {
                    info: outcome.key.info(),
                    created: outcome.is_created(),
                },
            )
        }
        KeyCommands::Update(args) => {
            let key_type = external_key_type(&args.label)?;
            let key = decode_key(&args.key_hex)?;
            let key = lifecycle
                .update(&args.label, &key, args.id, key_type)
                .into_result()?;
            print_json(
                out,
                &KeyView {
                    info: key.info(),
                    created: true,
                },
            )
        }
        KeyCommands::Delete { label, id } => {
            external_key_type(label)?;
            lifecycle.delete(label, *id)?;
            info!(label = %label, id, "key deleted");
            Ok(())
        }
        KeyCommands::DeleteAll { yes } => {
            if !yes {
                bail!("refusing to destroy every key without --yes");
            }
            let report = lifecycle.delete_all()?;
            writeln!(out, "destroyed {} of {} keys", report.destroyed, report.found)?;
            if !report.is_complete() {
                bail!("{} keys could not be destroyed", report.found - report.destroyed);
            }
            Ok(())
        }
    }
}

/// Read the audit file and check each signature against the token's audit key.
pub fn audit_tail(config: &SsmConfig, limit: usize, out: &mut dyn Write) -> anyhow::Result<()> {
    let path = config
        .audit
        .log_path
        .as_ref()
        .ok_or_else(|| anyhow!("audit.log_path is not configured"))?;
    let entries = FileAuditSink::new(path)?.tail(limit)?;
    let manager = SecretManager::from_config(config).context("starting the secret manager")?;
    for entry in &entries {
        let verified = verify_audit_entry(manager.signing_keys(), entry)?;
        writeln!(
            out,
            "{} {:<16} {:>3} {:>6}ms {} {}",
            entry.request_id,
            entry.action,
            entry.status_code,
            entry.duration_ms,
            if verified { "signed" } else { "UNVERIFIED" },
            entry.error.as_deref().unwrap_or("")
        )?;
    }
    manager.shutdown()?;
    Ok(())
}
