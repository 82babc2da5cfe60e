use serde::Serialize;
use sysinfo::System;

/// Snapshot of the load generator host, printed in the report header so
/// results from an overloaded generator can be told apart.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HostInfo {
    pub cpu_cores: u64,
    pub total_memory_mb: u64,
    pub available_memory_mb: u64,
}

pub fn get_hardware_info() -> HostInfo {
    let mut sys = System::new_all();
    sys.refresh_all();

    HostInfo {
        cpu_cores: sys.cpus().len() as u64,
        total_memory_mb: sys.total_memory() / 1024 / 1024,
        available_memory_mb: sys.available_memory() / 1024 / 1024,
    }
}
