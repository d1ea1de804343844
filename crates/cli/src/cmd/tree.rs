use anyhow::Context;
use clap::Args;
use orderproof_auditor::audit::{AuditService, AuditStore};
use orderproof_auditor::batch::BatchBuilder;
use orderproof_auditor::kv::SqliteKvStore;
use orderproof_auditor::retry::RetryPolicy;
use orderproof_auditor::storage::Storage;
use orderproof_core::{CanonicalEncoding, OrderId};
use std::sync::Arc;

#[derive(Debug, Args)]
pub struct TreeArgs {
    /// Audit store database URL (e.g. sqlite://orderproof.db)
    #[arg(long, default_value = "sqlite://orderproof.db")]
    database_url: String,

    /// Also print the inclusion proof for this order
    #[arg(long)]
    order_id: Option<OrderId>,
}

pub async fn run(args: TreeArgs) -> anyhow::Result<()> {
    let storage = Storage::new(&args.database_url, Some(1), Some(1))
        .await
        .with_context(|| format!("failed to open {}", args.database_url))?;
    let kv = Arc::new(SqliteKvStore::new(&storage));
    let audits = Arc::new(AuditService::new(
        AuditStore::new(kv, RetryPolicy::none(), 500),
        CanonicalEncoding::default(),
    ));

    let Some(built) = BatchBuilder::new(audits.clone()).build().await? else {
        println!("No audits recorded.");
        storage.close().await;
        return Ok(());
    };

    println!("merkleRoot: {}", built.root);
    println!("leafCount: {}", built.leaf_count);

    if let Some(order_id) = args.order_id {
        let record = audits
            .get(order_id)
            .await?
            .with_context(|| format!("no audit recorded for order {}", order_id))?;
        let proof = built
            .proof(order_id, &record.digest)
            .with_context(|| format!("order {} is not in the current tree", order_id))?;

        println!("digest: {}", record.digest);
        println!("leafIndex: {}", proof.leaf_index);
        println!("proof:");
        for sibling in proof.siblings_hex() {
            println!("  {}", sibling);
        }
    }

    storage.close().await;
    Ok(())
}
