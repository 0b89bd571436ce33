use rayon::prelude::*;

use super::{gaussian_half_width, gaussian_weights, Grid3};
use crate::error::Result;
use crate::tensor::Tensor;

/// Separable 3D Gaussian blur: three 1-D convolutions along X, Y, Z in
/// sequence, accumulating in `f32` regardless of input dtype. Output dtype
/// matches input (round-to-nearest for integer inputs). Boundary: reflect-101.
pub fn gaussian_3d(input: &Tensor, channel: usize, sigma_xyz: (f32, f32, f32)) -> Result<Tensor> {
	let mut grid = Grid3::channel_view(input, channel)?;

	let (sx, sy, sz) = sigma_xyz;
	if sx > 0.0 {
		grid = convolve_axis(&grid, sx, Axis::X);
	}
	if sy > 0.0 {
		grid = convolve_axis(&grid, sy, Axis::Y);
	}
	if sz > 0.0 {
		grid = convolve_axis(&grid, sz, Axis::Z);
	}

	grid.into_tensor(input.dtype())
}

#[derive(Clone, Copy)]
enum Axis {
	X,
	Y,
	Z,
}

fn convolve_axis(src: &Grid3, sigma: f32, axis: Axis) -> Grid3 {
	let half_width = gaussian_half_width(sigma);
	let weights = gaussian_weights(sigma, half_width);
	let mut out = Grid3::new(src.z, src.y, src.x);

	out.data
		.par_chunks_mut(src.y * src.x)
		.enumerate()
		.for_each(|(zi, plane)| {
			for yi in 0..src.y {
				for xi in 0..src.x {
					let mut acc = 0.0f32;
					for (k, &w) in weights.iter().enumerate() {
						let offset = k as isize - half_width as isize;
						let sample = match axis {
							Axis::X => src.get(zi as isize, yi as isize, xi as isize + offset),
							Axis::Y => src.get(zi as isize, yi as isize + offset, xi as isize),
							Axis::Z => src.get(zi as isize + offset, yi as isize, xi as isize),
						};
						acc += w * sample;
					}
					plane[yi * src.x + xi] = acc;
				}
			}
		});

	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::tensor::{DType, Location, Shape4};

	#[test]
	fn blur_stays_within_input_range() {
		let shape = Shape4::new(1, 4, 8, 8);
		let mut data = vec![0u16; shape.voxels() as usize];
		data[4 * 8 * 8 / 2] = 5000;
		let tensor = Tensor::from_host_u16(data.clone(), shape, Location::Host).unwrap();

		let blurred = gaussian_3d(&tensor, 0, (1.0, 1.0, 1.0)).unwrap();
		assert_eq!(blurred.dtype(), DType::U16);

		let max_in = *data.iter().max().unwrap() as f32;
		let min_in = *data.iter().min().unwrap() as f32;
		for v in blurred.to_host_f32() {
			assert!(v <= max_in + 1e-3);
			assert!(v >= min_in - 1e-3);
		}
	}

	#[test]
	fn zero_sigma_is_identity_per_axis() {
		let shape = Shape4::new(1, 2, 2, 2);
		let data: Vec<f32> = (0..8).map(|v| v as f32).collect();
		let tensor = Tensor::from_host_f32(data.clone(), shape, Location::Host).unwrap();
		let out = gaussian_3d(&tensor, 0, (0.0, 0.0, 0.0)).unwrap();
		assert_eq!(out.to_host_f32(), data);
	}
}
