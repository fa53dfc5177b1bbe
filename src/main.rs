use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use emaildb::db::EmailDb;
use emaildb::engine::{BlockEngine, BlockHealth};
use emaildb::error::{Error, ErrorClass};
use emaildb::version::{capability, FormatVersion};
use emaildb::{ChainVerdict, EmailDbConfig};

#[derive(Parser)]
#[command(name = "emaildb", version, about = "EmailDB storage engine CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify the header block and print version and capabilities
    Open { path: PathBuf },
    /// Recovery scan: enumerate every salvageable block without the header gate
    Scan {
        path: PathBuf,
        /// Print the per-frame health log
        #[arg(long)]
        verbose: bool,
    },
    /// Full hash-chain and per-block checksum verification
    Verify {
        path: PathBuf,
        /// 64 hex chars; required when batches are encrypted
        #[arg(long)]
        master_key: Option<String>,
    },
    /// Copy all reachable blocks of <src> into a fresh file <dst>
    Compact { src: PathBuf, dst: PathBuf },
    /// Upgrade a file to a target format version (e.g. 2.1.0)
    Migrate { path: PathBuf, to_version: String },
    /// Print one block's header fields and a payload preview
    Dump { path: PathBuf, block_id: i64 },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse().command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn run(command: Commands) -> emaildb::Result<ExitCode> {
    let cancel = CancellationToken::new();

    match command {
        // ── Open ─────────────────────────────────────────────────────────────
        Commands::Open { path } => {
            let db = EmailDb::open(&path, EmailDbConfig::default()).await?;
            let header = db.header();
            println!("── EmailDB ──────────────────────────────────────────────");
            println!("  Path           {}", path.display());
            println!("  Version        {}", db.detect_version());
            println!("  Created        {}", header.created_at);
            println!("  Modified       {}", header.modified_at);
            println!("  Blocks         {}", db.locations().len());
            println!("  Chain entries  {}", db.chain_len().await);
            let names = capability::names(db.capabilities());
            println!("  Capabilities   ({}):", names.len());
            for name in names {
                println!("    {name}");
            }
            db.close(&cancel).await?;
        }

        // ── Scan ─────────────────────────────────────────────────────────────
        Commands::Scan { path, verbose } => {
            let engine = BlockEngine::open(&path, false, false, 4).await?;
            let report = engine.scan().await?;
            println!("{}", report.summary());
            println!("  Candidates:     {}", report.total_candidates);
            println!("  Healthy:        {}", report.healthy);
            println!("  Header corrupt: {}", report.header_corrupt);
            println!("  Truncated:      {}", report.truncated);
            println!("  Payload corrupt:{}", report.payload_corrupt);
            if verbose {
                println!();
                for (i, sb) in report.blocks.iter().enumerate() {
                    let status = match &sb.health {
                        BlockHealth::Healthy => "✓ healthy".to_string(),
                        BlockHealth::HeaderCorrupt => "✗ header corrupt".to_string(),
                        BlockHealth::TruncatedPayload { declared, available } => {
                            format!("⚠ truncated ({declared} declared, {available} available)")
                        }
                        BlockHealth::PayloadCorrupt => "✗ payload corrupt".to_string(),
                    };
                    let kind = sb.kind.map(|k| k.name()).unwrap_or("?");
                    println!(
                        "  [{i:4}] @{:10}  id={:<16} {kind:<16} {status}",
                        sb.offset, sb.block_id
                    );
                }
            }
        }

        // ── Verify ───────────────────────────────────────────────────────────
        Commands::Verify { path, master_key } => {
            let db = EmailDb::open(&path, EmailDbConfig::default()).await?;
            if let Some(hex_key) = master_key {
                let raw = hex::decode(&hex_key)
                    .map_err(|_| Error::Internal("master key must be hex".into()))?;
                let key: [u8; 32] = raw
                    .try_into()
                    .map_err(|_| Error::Internal("master key must be 32 bytes".into()))?;
                db.unlock_keys(key).await?;
            }
            match db.verify().await? {
                ChainVerdict::Valid => {
                    println!("Valid: {} chain entr(ies) verified", db.chain_len().await);
                }
                ChainVerdict::InvalidAt { block_id, reason } => {
                    println!("INVALID at block {block_id}: {reason}");
                    return Ok(ExitCode::from(3));
                }
            }
            db.close(&cancel).await?;
        }

        // ── Compact ──────────────────────────────────────────────────────────
        Commands::Compact { src, dst } => {
            let engine = BlockEngine::open(&src, false, true, 4).await?;
            let copied = engine.compact(&dst, &cancel).await?;
            println!("Compacted {copied} block(s) → {}", dst.display());
        }

        // ── Migrate ──────────────────────────────────────────────────────────
        Commands::Migrate { path, to_version } => {
            let to = FormatVersion::parse(&to_version).ok_or(Error::UnsupportedVersion {
                found: to_version,
                detail: "expected major.minor.patch".into(),
            })?;
            let outcome = emaildb::migrate(&path, to, &cancel).await?;
            println!(
                "Migrated {} → {} ({:?}, {} block(s) rewritten)",
                outcome.from, outcome.to, outcome.plan, outcome.blocks_rewritten
            );
        }

        // ── Dump ─────────────────────────────────────────────────────────────
        Commands::Dump { path, block_id } => {
            let engine = BlockEngine::open(&path, false, false, 4).await?;
            let block = engine.read(block_id).await?;
            println!("── Block {block_id} ──────────────────────────────────────");
            println!("  Kind             {}", block.kind.name());
            println!("  Format version   {}", block.version);
            println!("  Flags            {:#04x}", block.flags);
            println!("  Payload encoding {}", block.payload_encoding.name());
            println!("  Timestamp        {}", block.timestamp);
            println!("  Payload length   {}", block.payload.len());
            let preview = &block.payload[..block.payload.len().min(256)];
            println!("  Payload preview  {}", hex::encode(preview));
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn exit_code(e: &Error) -> u8 {
    match e.class() {
        ErrorClass::Framing | ErrorClass::Integrity => 3,
        ErrorClass::Version => 4,
        _ => 1,
    }
}
