use super::{DeviceBackend, DeviceDescriptor, DeviceImpl};

/// Metal backend, preferred on macOS ARM. Probing allocates a minimal
/// shared-storage buffer and immediately releases it; unified memory on
/// Apple Silicon means `recommendedMaxWorkingSetSize` already accounts for
/// memory shared with the CPU, so it is used directly as the reported
/// total rather than re-deriving it from system RAM.
pub struct MetalDevice;

impl DeviceImpl for MetalDevice {
	fn probe(safety_factor: f32) -> Option<DeviceDescriptor> {
		let device = metal::Device::system_default()?;

		// No-op kernel: allocate 16 bytes of shared storage and drop it.
		let probe_buffer = device.new_buffer(16, metal::MTLResourceOptions::StorageModeShared);
		drop(probe_buffer);

		Some(DeviceDescriptor {
			backend: DeviceBackend::Metal,
			name: device.name().to_string(),
			total_memory_bytes: device.recommended_max_working_set_size(),
			safety_factor,
		})
	}
}
