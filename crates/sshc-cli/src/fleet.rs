//! Local smoke-testing fixture: a TOML file describing a mock fleet to
//! register against `MockOrchestrator` instead of a real backend.

use std::path::Path;

use serde::Deserialize;
use sshc_core::instance::InstanceId;
use sshc_core::orchestrator::MockOrchestrator;

#[derive(Debug, Clone, Deserialize)]
pub struct FleetEntry {
    pub id: u64,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
struct FleetFile {
    #[serde(default)]
    instances: Vec<FleetEntry>,
}

pub fn load_fleet(path: &Path) -> anyhow::Result<Vec<FleetEntry>> {
    let content = std::fs::read_to_string(path)?;
    let file: FleetFile = toml::from_str(&content)?;
    Ok(file.instances)
}

pub fn register_fleet(orchestrator: &MockOrchestrator, entries: &[FleetEntry]) {
    for entry in entries {
        orchestrator.register(InstanceId(entry.id), entry.host.clone(), entry.port);
    }
}
