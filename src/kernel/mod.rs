//! 3D compute kernels (spec component C). All kernels take rank-3 (Z,Y,X)
//! input and produce rank-3 output unless stated otherwise. The numeric
//! core below is backend-agnostic portable Rust, parallelized across the
//! machine's physical cores via `rayon` on the CPU backend; accelerator
//! backends dispatch the same core once their buffers are mapped for host
//! access (see `crate::device`).

mod cc3d;
pub(crate) mod fft;
mod gaussian;
mod otsu;
mod rolling_ball;
mod sobel;
mod watershed;

pub use cc3d::{connected_components_3d, Connectivity};
pub use fft::{fft3, ifft3, Complex3};
pub use gaussian::gaussian_3d;
pub use otsu::otsu_threshold;
pub use rolling_ball::rolling_ball_background;
pub use sobel::sobel_3d;
pub use watershed::watershed_3d;

use crate::error::{Error, Result};
use crate::tensor::{DType, Shape4, Tensor};

/// A plain (Z, Y, X) grid of `f32` intensities: the numeric working
/// representation every kernel accumulates in, regardless of the input
/// tensor's dtype. Integer dtypes are converted in and rounded back out at
/// the kernel boundary.
#[derive(Clone, Debug)]
pub(crate) struct Grid3 {
	pub z: usize,
	pub y: usize,
	pub x: usize,
	pub data: Vec<f32>,
}

impl Grid3 {
	pub fn new(z: usize, y: usize, x: usize) -> Self {
		Grid3 { z, y, x, data: vec![0.0; z * y * x] }
	}

	#[inline]
	pub fn idx(&self, zi: isize, yi: isize, xi: isize) -> usize {
		let (zi, yi, xi) = (
			reflect101(zi, self.z),
			reflect101(yi, self.y),
			reflect101(xi, self.x),
		);
		(zi * self.y + yi) * self.x + xi
	}

	#[inline]
	pub fn get(&self, zi: isize, yi: isize, xi: isize) -> f32 {
		self.data[self.idx(zi, yi, xi)]
	}

	pub fn channel_view(tensor: &Tensor, channel: usize) -> Result<Grid3> {
		let shape = tensor.shape();
		let (z, y, x) = (shape.z as usize, shape.y as usize, shape.x as usize);
		if channel >= shape.c as usize {
			return Err(Error::shape(format!("channel {channel} out of range for shape {shape:?}")));
		}
		let data = tensor.to_host_f32();
		let plane_len = z * y * x;
		let start = channel * plane_len;
		Ok(Grid3 { z, y, x, data: data[start..start + plane_len].to_vec() })
	}

	pub fn into_tensor(self, dtype: DType) -> Result<Tensor> {
		let shape = Shape4::new(1, self.z as u32, self.y as u32, self.x as u32);
		let f32_tensor = Tensor::from_host_f32(self.data, shape, crate::tensor::Location::Host)?;
		Ok(f32_tensor.astype(dtype))
	}
}

/// `reflect-101` boundary handling: mirrors without repeating the edge
/// sample, e.g. for length 5, index -1 maps to 1, index 5 maps to 3.
pub(crate) fn reflect101(i: isize, len: usize) -> usize {
	if len == 1 {
		return 0;
	}
	let len = len as isize;
	let period = 2 * (len - 1);
	let mut m = i % period;
	if m < 0 {
		m += period;
	}
	if m < len {
		m as usize
	} else {
		(period - m) as usize
	}
}

pub(crate) fn gaussian_half_width(sigma: f32) -> usize {
	(3.0 * sigma).ceil().max(0.0) as usize
}

pub(crate) fn gaussian_weights(sigma: f32, half_width: usize) -> Vec<f32> {
	let mut weights: Vec<f32> = (0..=2 * half_width)
		.map(|i| {
			let d = i as f32 - half_width as f32;
			(-0.5 * (d * d) / (sigma * sigma)).exp()
		})
		.collect();
	let sum: f32 = weights.iter().sum();
	if sum > 0.0 {
		weights.iter_mut().for_each(|w| *w /= sum);
	} else {
		weights = vec![0.0; 2 * half_width + 1];
		weights[half_width] = 1.0;
	}
	weights
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reflect101_mirrors_without_repeating_edge() {
		assert_eq!(reflect101(-1, 5), 1);
		assert_eq!(reflect101(5, 5), 3);
		assert_eq!(reflect101(0, 5), 0);
		assert_eq!(reflect101(4, 5), 4);
	}

	#[test]
	fn gaussian_weights_sum_to_one() {
		let w = gaussian_weights(1.5, gaussian_half_width(1.5));
		let sum: f32 = w.iter().sum();
		assert!((sum - 1.0).abs() < 1e-5);
	}
}
