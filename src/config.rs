//! Environment knobs. All of these are advisory: a missing or malformed
//! value is logged at `warn!` and the documented default is used instead,
//! never a hard error.

use crate::device::DeviceBackend;

const DEFAULT_SAFETY_FACTOR: f32 = 0.5;

/// Reads `DEFAULT_DEVICE`, overriding automatic backend detection when set.
pub fn forced_device_backend() -> Option<DeviceBackend> {
	let raw = std::env::var("DEFAULT_DEVICE").ok()?;
	match raw.to_ascii_uppercase().as_str() {
		"METAL" => Some(DeviceBackend::Metal),
		"CUDA" => Some(DeviceBackend::Cuda),
		"CPU" => Some(DeviceBackend::Cpu),
		other => {
			log::warn!("DEFAULT_DEVICE={other:?} is not one of METAL/CUDA/CPU, ignoring");
			None
		}
	}
}

/// Reads `MEMORY_SAFETY_FACTOR`, a float in (0,1]. Falls back to 0.5.
pub fn memory_safety_factor() -> f32 {
	match std::env::var("MEMORY_SAFETY_FACTOR") {
		Ok(raw) => match raw.parse::<f32>() {
			Ok(v) if v > 0.0 && v <= 1.0 => v,
			Ok(v) => {
				log::warn!("MEMORY_SAFETY_FACTOR={v} out of range (0,1], using default");
				DEFAULT_SAFETY_FACTOR
			}
			Err(_) => {
				log::warn!("MEMORY_SAFETY_FACTOR={raw:?} is not a float, using default");
				DEFAULT_SAFETY_FACTOR
			}
		},
		Err(_) => DEFAULT_SAFETY_FACTOR,
	}
}

/// Advisory tile-size hints in (Z, Y, X) order, from `TILE_Z_HINT` /
/// `TILE_Y_HINT` / `TILE_X_HINT`. Any axis without a valid hint is `None`
/// and the planner falls back to its own policy for that axis.
#[derive(Clone, Copy, Debug, Default)]
pub struct TileHints {
	pub z: Option<u32>,
	pub y: Option<u32>,
	pub x: Option<u32>,
}

pub fn tile_hints() -> TileHints {
	TileHints {
		z: env_u32("TILE_Z_HINT"),
		y: env_u32("TILE_Y_HINT"),
		x: env_u32("TILE_X_HINT"),
	}
}

fn env_u32(name: &str) -> Option<u32> {
	let raw = std::env::var(name).ok()?;
	match raw.parse::<u32>() {
		Ok(v) if v > 0 => Some(v),
		_ => {
			log::warn!("{name}={raw:?} is not a positive integer, ignoring");
			None
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn safety_factor_defaults_without_env() {
		std::env::remove_var("MEMORY_SAFETY_FACTOR");
		assert_eq!(memory_safety_factor(), DEFAULT_SAFETY_FACTOR);
	}

	#[test]
	fn tile_hints_ignore_zero() {
		std::env::set_var("TILE_Z_HINT", "0");
		assert_eq!(tile_hints().z, None);
		std::env::remove_var("TILE_Z_HINT");
	}
}
