pub mod audit;
pub mod events;
pub mod onboard;
pub mod send;
pub mod status;

use agentmesh_bus::MeshRuntime;
use agentmesh_core::{Config, Paths};

/// Load config (or defaults) and build the runtime.
pub(crate) fn load_runtime() -> anyhow::Result<(Config, MeshRuntime)> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let runtime = MeshRuntime::from_config(&config, &paths)?;
    Ok((config, runtime))
}
