use agentmesh_storage::EventStore;

use super::load_runtime;

pub async fn run(tenant: &str, aggregate: &str) -> anyhow::Result<()> {
    let (_, runtime) = load_runtime()?;

    let entries = runtime.event_store.load_entries(tenant, aggregate)?;
    if entries.is_empty() {
        println!("(No events for {}/{})", tenant, aggregate);
        return Ok(());
    }

    println!("Aggregate {}/{}: {} events", tenant, aggregate, entries.len());
    println!();
    for entry in entries {
        println!(
            "#{:<4} {}  {}  {}",
            entry.sequence,
            entry.event.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.event.event_type,
            entry.event.event_id
        );
        println!("      {}", serde_json::to_string(&entry.event.data)?);
    }
    Ok(())
}
