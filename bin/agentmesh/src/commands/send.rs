use agentmesh_core::{MessageParts, UniversalMessage};
use serde_json::Value;
use tracing::info;

use super::load_runtime;

pub async fn run(
    targets: Vec<String>,
    payload: Option<String>,
    tenant: Option<String>,
    token: Option<String>,
) -> anyhow::Result<()> {
    let (config, runtime) = load_runtime()?;

    let mut parts = MessageParts::new().tenant(tenant.unwrap_or(config.bus.tenant_id));
    for target in targets {
        parts = parts.target(target);
    }
    if let Some(raw) = payload {
        match serde_json::from_str::<Value>(&raw)? {
            Value::Object(fields) => parts = parts.payload(fields),
            _ => anyhow::bail!("--payload must be a JSON object"),
        }
    }
    if let Some(token) = token {
        parts = parts.token(token);
    }
    let message = UniversalMessage::new(parts);

    let results = runtime.router.route_message(&message).await?;
    info!(message_id = %message.id(), targets = results.len(), "Envelope routed");

    println!("Message {} (tenant {})", message.id(), message.tenant_id());
    let mut failed = 0;
    for (target, result) in &results {
        match result {
            Ok(ack) => match &ack.receipt {
                Some(receipt) => println!("  ✓ {} (receipt {})", target, receipt),
                None => println!("  ✓ {}", target),
            },
            Err(e) => {
                failed += 1;
                println!("  ✗ {}: {}", target, e);
            }
        }
    }
    println!();
    for line in runtime.metrics.render() {
        println!("{}", line);
    }

    if failed > 0 {
        anyhow::bail!("{} of {} targets failed", failed, results.len());
    }
    Ok(())
}
