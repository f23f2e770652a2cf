//! `skillrun abort`: set the durable abort flag for an invocation.
//!
//! The running process (possibly another `skillrun replay`) notices the
//! flag on its next poll. Only the jsonl backend is shared between
//! processes, so the memory backend is rejected.

use sr_domain::config::{Config, StorageBackend};
use sr_domain::invocation::InvocationKey;

use crate::bootstrap;

pub async fn run(config: &Config, result_id: String, version: u32, message: String) -> anyhow::Result<()> {
    if config.storage.backend != StorageBackend::Jsonl {
        anyhow::bail!("abort needs storage.backend = \"jsonl\"; the memory backend is private to its process");
    }

    let stores = bootstrap::open_stores(&config.storage)?;
    let key = InvocationKey::new(result_id, version);

    match stores.invocations.get_invocation(&key).await? {
        Some(row) if row.status.is_terminal() => {
            println!("{key} already finished");
            return Ok(());
        }
        Some(_) => {}
        None => tracing::warn!(key = %key, "no invocation row yet; setting the flag anyway"),
    }

    stores.aborts.request_abort(&key, &message).await?;
    println!("abort requested for {key}");
    Ok(())
}
