use anyhow::Context;
use clap::{Parser, Subcommand};
use orderproof_core::{TransactionFacts, B256};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "orderproof-verify")]
#[command(about = "Offline verification utilities for OrderProof", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Verify a saved /v1/verify response.
    Verify {
        /// Path to /v1/verify JSON
        #[arg(long)]
        response: PathBuf,
        /// Path to the order facts JSON you hold independently
        #[arg(long)]
        facts: Option<PathBuf>,
        /// Expected anchored root (0x-bytes32), e.g. from getLatestAnchor()
        #[arg(long)]
        root: Option<String>,
    },

    /// Verify a saved /v1/proof bundle.
    Proof {
        /// Path to /v1/proof JSON
        #[arg(long)]
        bundle: PathBuf,
        /// Expected root (0x-bytes32)
        #[arg(long)]
        root: Option<String>,
    },

    /// Print deterministic hashing vectors as JSON.
    Vectors,
}

fn read_json<T: for<'de> serde::Deserialize<'de>>(path: &PathBuf) -> anyhow::Result<T> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("failed to parse {}", path.display()))
}

fn parse_root(root: Option<String>) -> anyhow::Result<Option<B256>> {
    root.map(|s| s.parse::<B256>().context("invalid --root"))
        .transpose()
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Command::Verify {
            response,
            facts,
            root,
        } => {
            let response: orderproof_verifier::VerificationResponseJson = read_json(&response)?;
            let facts: Option<TransactionFacts> = facts.as_ref().map(read_json).transpose()?;

            let outcome =
                orderproof_verifier::verify_response(&response, facts.as_ref(), parse_root(root)?)?;
            match outcome.anchored_root {
                Some(root) => println!("OK: {} (anchored under {})", outcome.status, root),
                None => println!("OK: {}", outcome.status),
            }
        }

        Command::Proof { bundle, root } => {
            let bundle: orderproof_verifier::ProofBundleJson = read_json(&bundle)?;
            let root = orderproof_verifier::verify_proof_bundle(&bundle, parse_root(root)?)?;
            println!("OK: order {} is included under {}", bundle.order_id, root);
        }

        Command::Vectors => {
            let vectors = orderproof_verifier::generate_vectors()?;
            println!("{}", serde_json::to_string_pretty(&vectors)?);
        }
    }

    Ok(())
}
