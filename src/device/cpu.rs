use super::{unified_memory_budget, DeviceBackend, DeviceDescriptor, DeviceImpl};

/// The always-available fallback backend. A worker pool sized to the
/// machine's physical cores (via `rayon`'s global pool) runs every kernel.
/// Shares host RAM with the CPU, so it budgets memory per spec.md §4.A's
/// unified-memory policy rather than reporting raw total RAM.
pub struct CpuDevice;

impl DeviceImpl for CpuDevice {
	fn probe(safety_factor: f32) -> Option<DeviceDescriptor> {
		Some(DeviceDescriptor {
			backend: DeviceBackend::Cpu,
			name: format!("CPU ({} threads)", rayon::current_num_threads()),
			total_memory_bytes: unified_memory_budget(),
			safety_factor,
		})
	}
}
