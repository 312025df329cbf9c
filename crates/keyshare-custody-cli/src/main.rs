//! Key-Share Custody CLI
//!
//! Operator tool for inspecting and maintaining a local custody store.

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use keyshare_custody_core::{
    CreatePolicy, CustodyConfig, DeletePolicy, EncryptionKey, FileSystemBackend, KeyId,
    KeyShareCustody, OwnerId, RecordBackend, RotationReport,
    config::{ENV_KEY, ENV_RETIRED_KEYS},
};
use serde_json::Value;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keyshare-custody")]
#[command(about = "Encrypted key-share custody store", version)]
struct Cli {
    #[command(flatten)]
    store: StoreArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct StoreArgs {
    /// Storage backend
    #[arg(long, value_enum, default_value_t = BackendKind::Fs, global = true)]
    backend: BackendKind,

    /// Directory (fs) or database path (sled)
    #[arg(
        long,
        env = "KEYSHARE_CUSTODY_DATA_DIR",
        default_value = "./keyshares",
        global = true
    )]
    data_dir: PathBuf,

    /// Active encryption key, 64 hex chars
    #[arg(long, env = ENV_KEY, hide_env_values = true, global = true)]
    key: Option<String>,

    /// Retired keys still accepted for reading
    #[arg(
        long = "retired-key",
        env = ENV_RETIRED_KEYS,
        value_delimiter = ',',
        hide_env_values = true,
        global = true
    )]
    retired_keys: Vec<String>,

    /// Per-operation timeout in milliseconds (0 disables)
    #[arg(long, default_value_t = 10_000, global = true)]
    timeout_ms: u64,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendKind {
    /// One file per owner
    Fs,
    /// Embedded sled database
    Sled,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new encryption key
    GenKey,

    /// Store the first share for an owner
    Create {
        #[arg(short, long)]
        owner: String,

        #[command(flatten)]
        input: ShareInput,

        /// Replace an existing share instead of failing
        #[arg(long)]
        upsert: bool,
    },

    /// Print the decrypted share for an owner
    Get {
        #[arg(short, long)]
        owner: String,
    },

    /// Replace (or create) the share for an owner
    Update {
        #[arg(short, long)]
        owner: String,

        #[command(flatten)]
        input: ShareInput,
    },

    /// Remove the share for an owner
    Delete {
        #[arg(short, long)]
        owner: String,

        /// Succeed when no share exists
        #[arg(long)]
        idempotent: bool,
    },

    /// List owners with a stored share
    List,

    /// Show record metadata without decrypting
    Inspect {
        #[arg(short, long)]
        owner: String,
    },

    /// Re-seal every share under a new key
    ///
    /// Passing the current `--key` as `--new-key` resumes an unfinished pass.
    Rotate {
        /// New key, 64 hex chars
        #[arg(long, env = "KEYSHARE_CUSTODY_NEW_KEY", hide_env_values = true)]
        new_key: String,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct ShareInput {
    /// Share as inline JSON
    #[arg(long)]
    json: Option<String>,

    /// Read the share JSON from a file, or `-` for stdin
    #[arg(long)]
    file: Option<PathBuf>,
}

impl ShareInput {
    fn load(&self) -> Result<Value> {
        let text = match (&self.json, &self.file) {
            (Some(json), _) => json.clone(),
            (None, Some(path)) if path.as_os_str() == "-" => {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            }
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?,
            (None, None) => bail!("either --json or --file is required"),
        };
        serde_json::from_str(&text).context("share is not valid JSON")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::GenKey = cli.command {
        generate_key();
        return Ok(());
    }

    let config = build_config(&cli.store, &cli.command)?;

    match cli.store.backend {
        BackendKind::Fs => {
            let backend = FileSystemBackend::new(&cli.store.data_dir)?;
            run(KeyShareCustody::new(backend, config)?, cli.command).await
        }
        #[cfg(feature = "sled")]
        BackendKind::Sled => {
            let backend = keyshare_custody_core::SledBackend::open(&cli.store.data_dir)?;
            run(KeyShareCustody::new(backend, config)?, cli.command).await
        }
        #[cfg(not(feature = "sled"))]
        BackendKind::Sled => bail!("this build does not include the sled backend"),
    }
}

fn generate_key() {
    let key = EncryptionKey::generate();
    println!("{}", key.to_hex().as_str());
    eprintln!("key id: {}", key.key_id());
}

fn build_config(args: &StoreArgs, command: &Commands) -> Result<CustodyConfig> {
    let key = args
        .key
        .as_deref()
        .with_context(|| format!("an encryption key is required (--key or {})", ENV_KEY))?;

    let mut config = CustodyConfig::new(EncryptionKey::from_hex(key)?);
    for retired in args.retired_keys.iter().filter(|k| !k.trim().is_empty()) {
        config = config.with_retired_key(EncryptionKey::from_hex(retired)?);
    }

    config = match args.timeout_ms {
        0 => config.without_timeout(),
        ms => config.with_operation_timeout(Duration::from_millis(ms)),
    };

    match command {
        Commands::Create { upsert: true, .. } => {
            config = config.with_create_policy(CreatePolicy::Upsert);
        }
        Commands::Delete {
            idempotent: true, ..
        } => {
            config = config.with_delete_policy(DeletePolicy::Idempotent);
        }
        _ => {}
    }

    Ok(config)
}

async fn run<B: RecordBackend>(mut custody: KeyShareCustody<B>, command: Commands) -> Result<()> {
    match command {
        Commands::GenKey => generate_key(),

        Commands::Create { owner, input, .. } => {
            let owner = OwnerId::new(owner)?;
            let outcome = custody.create(&owner, &input.load()?).await?;
            println!("{}", serde_json::json!({ "owner": owner, "outcome": outcome }));
        }

        Commands::Get { owner } => {
            let owner = OwnerId::new(owner)?;
            match custody.get::<Value>(&owner).await? {
                Some(share) => println!("{}", serde_json::to_string_pretty(&share)?),
                None => bail!("no share stored for {}", owner),
            }
        }

        Commands::Update { owner, input } => {
            let owner = OwnerId::new(owner)?;
            let outcome = custody.update(&owner, &input.load()?).await?;
            println!("{}", serde_json::json!({ "owner": owner, "outcome": outcome }));
        }

        Commands::Delete { owner, .. } => {
            let owner = OwnerId::new(owner)?;
            let removed = custody.delete(&owner).await?;
            println!("{}", serde_json::json!({ "owner": owner, "removed": removed }));
        }

        Commands::List => {
            for owner in custody.list_owners().await? {
                println!("{}", owner);
            }
        }

        Commands::Inspect { owner } => {
            let owner = OwnerId::new(owner)?;
            match custody.metadata(&owner).await? {
                Some(metadata) => println!("{}", serde_json::to_string_pretty(&metadata)?),
                None => bail!("no share stored for {}", owner),
            }
        }

        Commands::Rotate { new_key } => {
            let new_key = EncryptionKey::from_hex(&new_key)?;
            let report = if new_key.key_id() == custody.active_key_id() {
                info!("New key is already active, resuming re-seal");
                custody.reseal_all().await?
            } else {
                custody.rotate_key(new_key).await?
            };
            println!("{}", serde_json::to_string_pretty(&report)?);

            // The keyring lives only in this process; the operator carries it forward
            let retired = custody.config().keyring.retired_key_ids();
            for line in rotation_guidance(&report, &retired) {
                eprintln!("{}", line);
            }

            if !report.is_complete() {
                bail!(
                    "rotation incomplete: {} failed, {} changed concurrently",
                    report.failed.len(),
                    report.changed_concurrently.len()
                );
            }
        }
    }

    Ok(())
}

/// Key configuration the operator must apply after a rotation
fn rotation_guidance(report: &RotationReport, retired: &[KeyId]) -> Vec<String> {
    let retired = retired
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let mut lines = vec![format!(
        "set {} to the new key (key id {})",
        ENV_KEY, report.active_key_id
    )];
    if report.is_complete() {
        lines.push(format!(
            "every share is sealed under the new key; {} can be emptied (retired key ids: {})",
            ENV_RETIRED_KEYS, retired
        ));
    } else {
        lines.push(format!(
            "keep the old keys in {} (key ids: {}) and run rotate again to finish",
            ENV_RETIRED_KEYS, retired
        ));
    }
    lines
}
