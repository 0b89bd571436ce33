use super::{DeviceBackend, DeviceDescriptor, DeviceImpl};

/// CUDA backend, preferred on non-Apple platforms. Probing opens device 0
/// and allocates a minimal buffer; any driver or allocation failure is
/// treated as "CUDA unavailable" rather than propagated.
pub struct CudaDevice;

impl DeviceImpl for CudaDevice {
	fn probe(safety_factor: f32) -> Option<DeviceDescriptor> {
		let device = cudarc::driver::CudaDevice::new(0).ok()?;
		let probe_buffer = device.alloc_zeros::<u8>(16).ok()?;
		drop(probe_buffer);

		let (free_bytes, _total_bytes) = device.mem_info().ok()?;
		let name = device.name().unwrap_or_else(|_| "CUDA device".to_string());

		Some(DeviceDescriptor {
			backend: DeviceBackend::Cuda,
			name,
			total_memory_bytes: free_bytes as u64,
			safety_factor,
		})
	}
}
