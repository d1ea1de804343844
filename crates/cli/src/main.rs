use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd;

#[derive(Debug, Parser)]
#[command(name = "orderproof")]
#[command(about = "Unified OrderProof operator CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reproduce an order's canonical string, digest and Merkle leaf.
    Digest(cmd::digest::DigestArgs),
    /// Build the current audit tree from an audit database.
    Tree(cmd::tree::TreeArgs),
    /// Verify a saved /v1/verify response offline.
    Verify(cmd::verify::VerifyArgs),
    /// Print deterministic hashing vectors as JSON.
    Vectors,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Digest(args) => cmd::digest::run(args)?,
        Command::Tree(args) => cmd::tree::run(args).await?,
        Command::Verify(args) => cmd::verify::run_verify(args)?,
        Command::Vectors => cmd::verify::run_vectors()?,
    }

    Ok(())
}
