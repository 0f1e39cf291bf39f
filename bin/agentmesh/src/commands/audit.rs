use agentmesh_storage::AuditStore;

use super::load_runtime;

pub async fn run(tenant: Option<String>, limit: usize) -> anyhow::Result<()> {
    let (config, runtime) = load_runtime()?;
    let tenant = tenant.unwrap_or(config.bus.tenant_id);

    let records = runtime.audit_store.query(&tenant, limit).await?;
    if records.is_empty() {
        println!("(No audit records for tenant {})", tenant);
        return Ok(());
    }

    println!(
        "📋 Audit ({}): {} records for tenant {}",
        runtime.audit_store.backend(),
        records.len(),
        tenant
    );
    println!();
    for record in records {
        println!(
            "{}  {}  {}",
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.message_id,
            record.targets.join(", ")
        );
        println!("    {}", serde_json::to_string(&record.payload)?);
    }
    Ok(())
}
