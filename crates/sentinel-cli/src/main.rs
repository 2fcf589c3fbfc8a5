//! Operator CLI for the sentinel core.
//!
//! Works directly against a data directory: generates and rotates
//! keypairs, encrypts and decrypts envelopes, and inspects audit state.
//! The session-token surface is a server concern; this tool is for
//! operators with filesystem access.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use sentinel_core::asr::{AsrPipeline, PipelineConfig, RecordFilter};
use sentinel_core::config::SentinelConfig;
use sentinel_core::crypto::KemAlgorithm;
use sentinel_core::identity::AgentId;
use sentinel_core::pqc::{HybridEngine, KeyStore};

#[derive(Parser)]
#[command(name = "sentinel", version, about = "PULSAR SENTINEL operator tooling")]
struct Cli {
    /// Data directory holding keys/, asr/, and batches/.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a keypair for an owner address.
    Keygen {
        /// Owner wallet address (0x-prefixed).
        #[arg(long)]
        owner: String,

        /// Security level: 768 or 1024.
        #[arg(long, default_value_t = 768)]
        level: u32,
    },

    /// Encrypt stdin to a keypair; writes a base64 envelope to stdout.
    Encrypt {
        /// Recipient key id.
        #[arg(long)]
        key_id: String,
    },

    /// Decrypt a base64 envelope from stdin; writes plaintext to stdout.
    Decrypt {
        /// Recipient key id.
        #[arg(long)]
        key_id: String,
    },

    /// Rotate a keypair, leaving the old key decryptable in its grace
    /// window.
    Rotate {
        /// Key id to rotate.
        #[arg(long)]
        key_id: String,
    },

    /// Show stored keys, record counts, and batch anchor states.
    Status,

    /// List audit records for an agent.
    Records {
        /// Agent wallet address (0x-prefixed).
        #[arg(long)]
        agent: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = SentinelConfig::from_env().context("loading configuration")?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    let store = Arc::new(
        KeyStore::open(config.data_dir.join("keys"), &config.keystore_passphrase)
            .context("opening key store")?,
    );
    let engine = HybridEngine::new(
        Arc::clone(&store),
        config.pqc_level,
        config.key_rotation,
        config.key_grace,
    );

    match cli.command {
        Command::Keygen { owner, level } => {
            let owner = AgentId::parse(&owner).context("parsing owner address")?;
            let Some(algorithm) = KemAlgorithm::from_security_level(level) else {
                bail!("security level must be 768 or 1024, got {level}");
            };
            let stored = store.generate(&owner, algorithm)?;
            println!("{}", stored.metadata.key_id);
        },

        Command::Encrypt { key_id } => {
            let plaintext = read_stdin()?;
            let envelope = engine.encrypt_hybrid(&key_id, &plaintext)?;
            println!("{}", BASE64.encode(envelope));
        },

        Command::Decrypt { key_id } => {
            let input = String::from_utf8(read_stdin()?).context("envelope is not UTF-8")?;
            let envelope = BASE64
                .decode(input.trim())
                .context("envelope is not base64")?;
            let plaintext = engine.decrypt(&key_id, &envelope)?;
            std::io::stdout().write_all(&plaintext)?;
        },

        Command::Rotate { key_id } => {
            let outcome = engine.rotate(&key_id)?;
            println!("{}", outcome.new_key.metadata.key_id);
        },

        Command::Status => {
            let pipeline = open_pipeline(&config)?;
            println!("keys:");
            for key in store.list(None)? {
                println!(
                    "  {}  {}  owner={}  stale={}",
                    key.key_id, key.algorithm, key.owner, key.stale
                );
            }
            println!("records: {}", pipeline.record_count());
            println!("batches:");
            for batch in pipeline.batches()? {
                println!(
                    "  {}  records={}  state={:?}",
                    batch.batch_id,
                    batch.records.len(),
                    batch.anchor_state
                );
            }
        },

        Command::Records { agent } => {
            let agent = AgentId::parse(&agent).context("parsing agent address")?;
            let pipeline = open_pipeline(&config)?;
            for record in pipeline.records_for(&agent, &RecordFilter::default())? {
                println!(
                    "{}  {}  {}  level={}",
                    record.timestamp,
                    record.asr_id,
                    record.action,
                    record.threat_level.as_u8()
                );
            }
        },
    }

    Ok(())
}

fn open_pipeline(config: &SentinelConfig) -> Result<AsrPipeline> {
    AsrPipeline::open(
        &config.data_dir,
        PipelineConfig {
            batch_max: config.batch_max,
            batch_max_age: config.batch_max_age,
        },
    )
    .context("opening record pipeline")
}

fn read_stdin() -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    std::io::stdin()
        .read_to_end(&mut buffer)
        .context("reading stdin")?;
    Ok(buffer)
}
