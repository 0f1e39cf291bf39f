use agentmesh_bus::MeshRuntime;
use agentmesh_core::{Config, Paths};

pub async fn run() -> anyhow::Result<()> {
    let paths = Paths::new();

    println!("agentmesh status");
    println!("================");
    println!();

    let config_path = paths.config_file();
    let config_exists = config_path.exists();
    println!(
        "Config:    {} {}",
        config_path.display(),
        if config_exists { "✓" } else { "✗ (not found, using defaults)" }
    );

    let config = Config::load_or_default(&paths)?;
    println!("Tenant:    {}", config.bus.tenant_id);
    if let Some(scope) = &config.router.tenant_scope {
        println!("Scope:     {}", scope);
    }
    println!();

    println!("Storage:");
    println!(
        "  audit   {:?} ({})",
        config.storage.audit,
        config.storage.audit_db_path(&paths).display()
    );
    println!(
        "  events  {:?} ({})",
        config.storage.events,
        config.storage.events_db_path(&paths).display()
    );
    println!();

    let runtime = MeshRuntime::from_config(&config, &paths)?;
    println!("Adapters:");
    for (scheme, kind) in runtime.adapter_kinds() {
        let default_mark = if *scheme == config.bus.default_scheme {
            " (default)"
        } else {
            ""
        };
        println!("  {:<12} {}{}", scheme, kind, default_mark);
    }

    if !config_exists {
        println!();
        println!("Run `agentmesh onboard` to write a config file.");
    }

    Ok(())
}
