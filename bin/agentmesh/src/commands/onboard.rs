use agentmesh_core::{Config, Paths};
use std::io::{self, Write};

pub async fn run(force: bool) -> anyhow::Result<()> {
    let paths = Paths::new();

    if paths.config_file().exists() && !force {
        print!("Config already exists. Overwrite? [y/N] ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    }

    paths.ensure_dirs()?;
    Config::default().save(&paths.config_file())?;
    println!("✓ Created config: {}", paths.config_file().display());
    println!("✓ Data directory: {}", paths.data_dir().display());
    println!();
    println!("Next steps:");
    println!("  1. Edit {} to add adapters", paths.config_file().display());
    println!("  2. Run `agentmesh status` to verify configuration");
    println!("  3. Run `agentmesh send --target default:hello` to route a test envelope");

    Ok(())
}
