use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Args;
use orderproof_core::{
    codec::{canonicalize_with, digest_canonical},
    compute_leaf_hash, CanonicalEncoding, OrderId, TransactionFacts, ALGORITHM,
};
use rust_decimal::Decimal;
use serde::Serialize;

#[derive(Debug, Args)]
pub struct DigestArgs {
    /// Order id
    #[arg(long)]
    order_id: OrderId,
    /// Total credits across all items
    #[arg(long)]
    credits: i64,
    /// Total price, e.g. 250.51
    #[arg(long)]
    price: Decimal,
    /// Payment time as Unix milliseconds
    #[arg(long)]
    paid_at_millis: i64,
    /// Buyer identifier (delimited encoding only)
    #[arg(long)]
    buyer: Option<String>,
    /// Seller identifier (delimited encoding only)
    #[arg(long)]
    seller: Option<String>,
    /// Canonical encoding: legacy or delimited
    #[arg(long, default_value = "legacy")]
    encoding: CanonicalEncoding,
    /// Print JSON instead of text
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DigestOutput {
    order_id: OrderId,
    algorithm: &'static str,
    encoding: CanonicalEncoding,
    hash_formula: &'static str,
    canonical_input: String,
    digest: String,
    leaf_hash: String,
}

fn describe(facts: &TransactionFacts, encoding: CanonicalEncoding) -> DigestOutput {
    let canonical_input = canonicalize_with(facts, encoding);
    let digest = digest_canonical(&canonical_input);
    DigestOutput {
        order_id: facts.order_id,
        algorithm: ALGORITHM,
        encoding,
        hash_formula: encoding.hash_formula(),
        leaf_hash: compute_leaf_hash(facts.order_id, &digest).to_string(),
        canonical_input,
        digest,
    }
}

pub fn run(args: DigestArgs) -> anyhow::Result<()> {
    let paid_at = DateTime::<Utc>::from_timestamp_millis(args.paid_at_millis)
        .context("--paid-at-millis is out of range")?;
    let facts = TransactionFacts {
        order_id: args.order_id,
        total_credits: args.credits,
        total_price: args.price,
        paid_at,
        buyer: args.buyer,
        seller: args.seller,
    };

    let output = describe(&facts, args.encoding);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("formula:   {}", output.hash_formula);
        println!("canonical: {}", output.canonical_input);
        println!("digest:    {}", output.digest);
        println!("leafHash:  {}", output.leaf_hash);
    }

    Ok(())
}
