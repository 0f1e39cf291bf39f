use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".agentmesh"))
            .unwrap_or_else(|| PathBuf::from(".agentmesh"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    /// Daily JSONL audit files.
    pub fn audit_dir(&self) -> PathBuf {
        self.base.join("audit")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.base.join("data")
    }

    pub fn audit_db(&self) -> PathBuf {
        self.data_dir().join("audit.db")
    }

    pub fn events_db(&self) -> PathBuf {
        self.data_dir().join("events.db")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.audit_dir())?;
        std::fs::create_dir_all(self.data_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
