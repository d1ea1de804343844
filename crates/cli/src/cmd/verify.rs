use anyhow::Context;
use clap::Args;
use orderproof_core::{TransactionFacts, B256};
use std::path::PathBuf;

#[derive(Debug, Args)]
pub struct VerifyArgs {
    /// Path to /v1/verify JSON
    #[arg(long)]
    response: PathBuf,
    /// Path to order facts JSON to check the canonical input against
    #[arg(long)]
    facts: Option<PathBuf>,
    /// Expected anchored root (0x-bytes32)
    #[arg(long)]
    root: Option<String>,
}

fn read_json<T: for<'de> serde::Deserialize<'de>>(path: &PathBuf) -> anyhow::Result<T> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn run_verify(args: VerifyArgs) -> anyhow::Result<()> {
    let response: orderproof_verifier::VerificationResponseJson = read_json(&args.response)?;
    let facts: Option<TransactionFacts> = args.facts.as_ref().map(read_json).transpose()?;
    let root = args
        .root
        .map(|s| s.parse::<B256>().context("invalid --root"))
        .transpose()?;

    let outcome = orderproof_verifier::verify_response(&response, facts.as_ref(), root)?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

pub fn run_vectors() -> anyhow::Result<()> {
    let vectors = orderproof_verifier::generate_vectors()?;
    println!("{}", serde_json::to_string_pretty(&vectors)?);
    Ok(())
}
