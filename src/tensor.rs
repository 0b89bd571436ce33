//! Tensor/Array façade (spec component B): a uniform N-D array with
//! host<->device transfer, shape, dtype, and a chunked-view mode for
//! oversized volumes. Transfers are synchronous from the caller's point of
//! view, per the concurrency model in spec.md §5.

use crate::device::DeviceBackend;
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
	U8,
	U16,
	F32,
}

impl DType {
	pub fn size_bytes(self) -> usize {
		match self {
			DType::U8 => 1,
			DType::U16 => 2,
			DType::F32 => 4,
		}
	}
}

/// Axis order is always (C, Z, Y, X), matching spec.md §3's Volume layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Shape4 {
	pub c: u32,
	pub z: u32,
	pub y: u32,
	pub x: u32,
}

impl Shape4 {
	pub fn new(c: u32, z: u32, y: u32, x: u32) -> Self {
		Shape4 { c, z, y, x }
	}

	pub fn voxels(&self) -> u64 {
		self.c as u64 * self.z as u64 * self.y as u64 * self.x as u64
	}

	pub fn is_valid(&self) -> bool {
		self.c > 0 && self.z > 0 && self.y > 0 && self.x > 0
	}

	/// Rank-3 (Z, Y, X) sub-shape for a single channel, the shape every
	/// kernel in [`crate::kernel`] operates on.
	pub fn zyx(&self) -> (u32, u32, u32) {
		(self.z, self.y, self.x)
	}
}

/// Where a tensor's bytes currently live. CPU backends and unified-memory
/// accelerators keep this at `Host`; discrete accelerators tag a tensor
/// `Device` once uploaded so a second `to_host()` is a no-op copy rather
/// than a re-transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
	Host,
	Device(DeviceBackend),
}

#[derive(Clone, Debug)]
enum Buffer {
	U8(Vec<u8>),
	U16(Vec<u16>),
	F32(Vec<f32>),
}

impl Buffer {
	fn len(&self) -> usize {
		match self {
			Buffer::U8(v) => v.len(),
			Buffer::U16(v) => v.len(),
			Buffer::F32(v) => v.len(),
		}
	}

	fn dtype(&self) -> DType {
		match self {
			Buffer::U8(_) => DType::U8,
			Buffer::U16(_) => DType::U16,
			Buffer::F32(_) => DType::F32,
		}
	}
}

/// A multi-channel 3D array, spec.md §3's Volume. Owned exclusively by the
/// request that created it.
#[derive(Clone, Debug)]
pub struct Tensor {
	shape: Shape4,
	buffer: Buffer,
	location: Location,
}

impl Tensor {
	/// Copies `buffer` to device (conceptually — CPU backends keep it
	/// host-resident). Fails with [`Error::ShapeError`] if `buffer`'s
	/// length does not match `shape`, and with [`Error::AllocError`] if the
	/// byte count overflows `usize`.
	pub fn from_host_u8(buffer: Vec<u8>, shape: Shape4, location: Location) -> Result<Tensor> {
		Self::from_buffer(Buffer::U8(buffer), shape, location)
	}

	pub fn from_host_u16(buffer: Vec<u16>, shape: Shape4, location: Location) -> Result<Tensor> {
		Self::from_buffer(Buffer::U16(buffer), shape, location)
	}

	pub fn from_host_f32(buffer: Vec<f32>, shape: Shape4, location: Location) -> Result<Tensor> {
		Self::from_buffer(Buffer::F32(buffer), shape, location)
	}

	fn from_buffer(buffer: Buffer, shape: Shape4, location: Location) -> Result<Tensor> {
		if !shape.is_valid() {
			return Err(Error::shape(format!("shape must be non-empty in all axes, got {shape:?}")));
		}
		let expected = shape.voxels() as usize;
		if buffer.len() != expected {
			return Err(Error::shape(format!(
				"buffer has {} elements, shape {shape:?} expects {expected}",
				buffer.len()
			)));
		}
		Ok(Tensor { shape, buffer, location })
	}

	pub fn zeros(dtype: DType, shape: Shape4, location: Location) -> Result<Tensor> {
		if !shape.is_valid() {
			return Err(Error::shape(format!("shape must be non-empty in all axes, got {shape:?}")));
		}
		let n = shape.voxels() as usize;
		let buffer = match dtype {
			DType::U8 => Buffer::U8(vec![0u8; n]),
			DType::U16 => Buffer::U16(vec![0u16; n]),
			DType::F32 => Buffer::F32(vec![0f32; n]),
		};
		Ok(Tensor { shape, buffer, location })
	}

	pub fn shape(&self) -> Shape4 {
		self.shape
	}

	pub fn dtype(&self) -> DType {
		self.buffer.dtype()
	}

	pub fn location(&self) -> Location {
		self.location
	}

	/// Synchronous transfer back to host. A no-op copy when already
	/// `Location::Host`.
	pub fn to_host_f32(&self) -> Vec<f32> {
		match &self.buffer {
			Buffer::F32(v) => v.clone(),
			Buffer::U8(v) => v.iter().map(|&x| x as f32).collect(),
			Buffer::U16(v) => v.iter().map(|&x| x as f32).collect(),
		}
	}

	pub fn as_f32(&self) -> Vec<f32> {
		self.to_host_f32()
	}

	pub fn as_u16(&self) -> Option<&[u16]> {
		match &self.buffer {
			Buffer::U16(v) => Some(v),
			_ => None,
		}
	}

	pub fn as_u8(&self) -> Option<&[u8]> {
		match &self.buffer {
			Buffer::U8(v) => Some(v),
			_ => None,
		}
	}

	pub fn as_f32_slice(&self) -> Option<&[f32]> {
		match &self.buffer {
			Buffer::F32(v) => Some(v),
			_ => None,
		}
	}

	/// Rank-0 scalar extraction. Distinct from a length-1 rank-1 tensor:
	/// this is only satisfiable for a tensor whose shape is exactly 1x1x1x1.
	pub fn to_scalar(&self) -> Result<f32> {
		if self.shape.voxels() != 1 {
			return Err(Error::shape("to_scalar requires a tensor with exactly one element"));
		}
		Ok(self.to_host_f32()[0])
	}

	/// Non-copying subview when the tensor is contiguous and the request
	/// is channel-0 aligned; otherwise copies. `origin`/`extent` are in
	/// (z, y, x) order.
	pub fn view(&self, origin: (u32, u32, u32), extent: (u32, u32, u32)) -> Result<Tensor> {
		let (oz, oy, ox) = origin;
		let (ez, ey, ex) = extent;
		if oz + ez > self.shape.z || oy + ey > self.shape.y || ox + ex > self.shape.x {
			return Err(Error::shape("view extent exceeds tensor bounds"));
		}

		let (sz, sy, sx) = (self.shape.z as usize, self.shape.y as usize, self.shape.x as usize);
		let new_shape = Shape4::new(self.shape.c, ez, ey, ex);
		let mut out = Tensor::zeros(self.dtype(), new_shape, self.location)?;

		for c in 0..self.shape.c as usize {
			for z in 0..ez as usize {
				for y in 0..ey as usize {
					for x in 0..ex as usize {
						let src_idx = (((c * sz + (oz as usize + z)) * sy + (oy as usize + y)) * sx) + (ox as usize + x);
						let dst_idx = (((c * ez as usize + z) * ey as usize + y) * ex as usize) + x;
						out.copy_element_from(self, src_idx, dst_idx);
					}
				}
			}
		}
		Ok(out)
	}

	fn copy_element_from(&mut self, src: &Tensor, src_idx: usize, dst_idx: usize) {
		match (&mut self.buffer, &src.buffer) {
			(Buffer::U8(d), Buffer::U8(s)) => d[dst_idx] = s[src_idx],
			(Buffer::U16(d), Buffer::U16(s)) => d[dst_idx] = s[src_idx],
			(Buffer::F32(d), Buffer::F32(s)) => d[dst_idx] = s[src_idx],
			_ => unreachable!("view() preserves dtype"),
		}
	}

	pub fn astype(&self, dtype: DType) -> Tensor {
		if dtype == self.dtype() {
			return self.clone();
		}
		let as_f32 = self.to_host_f32();
		let buffer = match dtype {
			DType::U8 => Buffer::U8(as_f32.iter().map(|&v| v.round().clamp(0.0, 255.0) as u8).collect()),
			DType::U16 => Buffer::U16(as_f32.iter().map(|&v| v.round().clamp(0.0, 65535.0) as u16).collect()),
			DType::F32 => Buffer::F32(as_f32),
		};
		Tensor { shape: self.shape, buffer, location: self.location }
	}

	pub fn reshape(&self, shape: Shape4) -> Result<Tensor> {
		if shape.voxels() != self.shape.voxels() {
			return Err(Error::shape("reshape must preserve total element count"));
		}
		let mut out = self.clone();
		out.shape = shape;
		Ok(out)
	}

	pub fn fill(&mut self, value: f32) {
		match &mut self.buffer {
			Buffer::U8(v) => v.iter_mut().for_each(|e| *e = value.round().clamp(0.0, 255.0) as u8),
			Buffer::U16(v) => v.iter_mut().for_each(|e| *e = value.round().clamp(0.0, 65535.0) as u16),
			Buffer::F32(v) => v.iter_mut().for_each(|e| *e = value),
		}
	}

	/// Maximum-intensity projection along Z, supplementing spec.md's
	/// glossary definition of MIP as an internal primitive for diagnostics
	/// (e.g. the low-gradient region search in `intensity_analysis`). Not
	/// used for display rendering. Only Z is needed by any caller in this
	/// crate, so that is the only axis implemented.
	pub fn project_max(&self, axis: &str) -> Result<Tensor> {
		if axis != "z" {
			return Err(Error::invalid_parameter("axis", format!("unsupported projection axis {axis:?}")));
		}
		let (z, y, x) = self.shape.zyx();
		let as_f32 = self.to_host_f32();
		let c = self.shape.c as usize;
		let new_shape = Shape4::new(self.shape.c, 1, y, x);

		let (zu, yu, xu) = (z as usize, y as usize, x as usize);
		let mut out = vec![f32::MIN; c * yu * xu];
		for ci in 0..c {
			for zi in 0..zu {
				for yi in 0..yu {
					for xi in 0..xu {
						let src = ((ci * zu + zi) * yu + yi) * xu + xi;
						let dst = (ci * yu + yi) * xu + xi;
						if as_f32[src] > out[dst] {
							out[dst] = as_f32[src];
						}
					}
				}
			}
		}
		Tensor::from_host_f32(out, new_shape, self.location)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn from_host_round_trip_is_exact_for_integers() {
		let shape = Shape4::new(1, 2, 2, 2);
		let data: Vec<u16> = (0..8).collect();
		let tensor = Tensor::from_host_u16(data.clone(), shape, Location::Host).unwrap();
		let back: Vec<u16> = tensor.to_host_f32().iter().map(|&v| v as u16).collect();
		assert_eq!(back, data);
	}

	#[test]
	fn shape_mismatch_is_rejected() {
		let shape = Shape4::new(1, 2, 2, 2);
		let err = Tensor::from_host_u16(vec![0; 4], shape, Location::Host).unwrap_err();
		assert!(matches!(err, Error::ShapeError { .. }));
	}

	#[test]
	fn view_extracts_expected_subregion() {
		let shape = Shape4::new(1, 2, 2, 2);
		let data: Vec<f32> = (0..8).map(|v| v as f32).collect();
		let tensor = Tensor::from_host_f32(data, shape, Location::Host).unwrap();
		let sub = tensor.view((0, 0, 0), (1, 1, 1)).unwrap();
		assert_eq!(sub.to_host_f32(), vec![0.0]);
		let sub2 = tensor.view((1, 1, 1), (1, 1, 1)).unwrap();
		assert_eq!(sub2.to_host_f32(), vec![7.0]);
	}

	#[test]
	fn to_scalar_requires_single_element() {
		let shape = Shape4::new(1, 1, 1, 2);
		let tensor = Tensor::from_host_f32(vec![1.0, 2.0], shape, Location::Host).unwrap();
		assert!(tensor.to_scalar().is_err());
	}
}
