use rustfft::num_complex::Complex32;
use rustfft::FftPlanner;

use crate::error::Result;
use crate::tensor::{DType, Location, Shape4, Tensor};

use super::Grid3;

/// A complex-valued (Z, Y, X) volume, the output of [`fft3`] and input to
/// [`ifft3`].
#[derive(Clone, Debug)]
pub struct Complex3 {
	pub z: usize,
	pub y: usize,
	pub x: usize,
	pub data: Vec<Complex32>,
}

impl Complex3 {
	pub fn zeros(z: usize, y: usize, x: usize) -> Self {
		Complex3 { z, y, x, data: vec![Complex32::new(0.0, 0.0); z * y * x] }
	}

	pub fn multiply_elementwise(&self, other: &Complex3) -> Complex3 {
		let mut out = self.clone();
		for (o, &m) in out.data.iter_mut().zip(other.data.iter()) {
			*o *= m;
		}
		out
	}
}

/// Next size whose only prime factors are 2, 3, 5, or 7 ("5-smooth" plus 7),
/// the family `rustfft`'s mixed-radix planner handles fastest.
pub(crate) fn good_transform_size(minimum: usize) -> usize {
	let mut n = minimum.max(1);
	loop {
		let mut m = n;
		for p in [2usize, 3, 5, 7] {
			while m % p == 0 {
				m /= p;
			}
		}
		if m == 1 {
			return n;
		}
		n += 1;
	}
}

/// Forward complex FFT on a real rank-3 volume, zero-padded to a
/// good transform size along each axis.
pub fn fft3(input: &Tensor, channel: usize) -> Result<Complex3> {
	let grid = Grid3::channel_view(input, channel)?;
	let (pz, py, px) = (
		good_transform_size(grid.z),
		good_transform_size(grid.y),
		good_transform_size(grid.x),
	);

	let mut padded = Complex3::zeros(pz, py, px);
	for zi in 0..grid.z {
		for yi in 0..grid.y {
			for xi in 0..grid.x {
				let src = (zi * grid.y + yi) * grid.x + xi;
				let dst = (zi * py + yi) * px + xi;
				padded.data[dst] = Complex32::new(grid.data[src], 0.0);
			}
		}
	}

	let mut planner = FftPlanner::<f32>::new();
	transform_in_place(&mut padded, &mut planner, Direction::Forward);
	Ok(padded)
}

/// Inverse FFT, normalizing by the total element count, cropped back to
/// `output_shape`.
pub fn ifft3(input: &Complex3, output_shape: (usize, usize, usize)) -> Result<Tensor> {
	let mut data = input.clone();
	let mut planner = FftPlanner::<f32>::new();
	transform_in_place(&mut data, &mut planner, Direction::Inverse);

	let scale = 1.0 / (data.z * data.y * data.x) as f32;
	let (oz, oy, ox) = output_shape;
	let mut real = vec![0.0f32; oz * oy * ox];
	for zi in 0..oz {
		for yi in 0..oy {
			for xi in 0..ox {
				let src = (zi * data.y + yi) * data.x + xi;
				let dst = (zi * oy + yi) * ox + xi;
				real[dst] = data.data[src].re * scale;
			}
		}
	}

	let shape = Shape4::new(1, oz as u32, oy as u32, ox as u32);
	Tensor::from_host_f32(real, shape, Location::Host).map(|t| t.astype(DType::F32))
}

#[derive(Clone, Copy)]
pub(crate) enum Direction {
	Forward,
	Inverse,
}

pub(crate) fn transform_in_place(vol: &mut Complex3, planner: &mut FftPlanner<f32>, dir: Direction) {
	transform_axis_x(vol, planner, dir);
	transform_axis_y(vol, planner, dir);
	transform_axis_z(vol, planner, dir);
}

fn plan(planner: &mut FftPlanner<f32>, len: usize, dir: Direction) -> std::sync::Arc<dyn rustfft::Fft<f32>> {
	match dir {
		Direction::Forward => planner.plan_fft_forward(len),
		Direction::Inverse => planner.plan_fft_inverse(len),
	}
}

fn transform_axis_x(vol: &mut Complex3, planner: &mut FftPlanner<f32>, dir: Direction) {
	let fft = plan(planner, vol.x, dir);
	for zi in 0..vol.z {
		for yi in 0..vol.y {
			let start = (zi * vol.y + yi) * vol.x;
			fft.process(&mut vol.data[start..start + vol.x]);
		}
	}
}

fn transform_axis_y(vol: &mut Complex3, planner: &mut FftPlanner<f32>, dir: Direction) {
	let fft = plan(planner, vol.y, dir);
	let mut line = vec![Complex32::new(0.0, 0.0); vol.y];
	for zi in 0..vol.z {
		for xi in 0..vol.x {
			for yi in 0..vol.y {
				line[yi] = vol.data[(zi * vol.y + yi) * vol.x + xi];
			}
			fft.process(&mut line);
			for yi in 0..vol.y {
				vol.data[(zi * vol.y + yi) * vol.x + xi] = line[yi];
			}
		}
	}
}

fn transform_axis_z(vol: &mut Complex3, planner: &mut FftPlanner<f32>, dir: Direction) {
	let fft = plan(planner, vol.z, dir);
	let mut line = vec![Complex32::new(0.0, 0.0); vol.z];
	for yi in 0..vol.y {
		for xi in 0..vol.x {
			for zi in 0..vol.z {
				line[zi] = vol.data[(zi * vol.y + yi) * vol.x + xi];
			}
			fft.process(&mut line);
			for zi in 0..vol.z {
				vol.data[(zi * vol.y + yi) * vol.x + xi] = line[zi];
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::tensor::Shape4;

	#[test]
	fn good_transform_size_is_never_smaller_than_minimum() {
		for n in 1..40 {
			assert!(good_transform_size(n) >= n);
		}
		assert_eq!(good_transform_size(8), 8);
	}

	#[test]
	fn forward_then_inverse_round_trips() {
		let shape = Shape4::new(1, 4, 5, 6);
		let n = shape.voxels() as usize;
		let data: Vec<f32> = (0..n).map(|i| (i % 7) as f32).collect();
		let tensor = Tensor::from_host_f32(data.clone(), shape, Location::Host).unwrap();

		let freq = fft3(&tensor, 0).unwrap();
		let back = ifft3(&freq, (4, 5, 6)).unwrap();

		for (a, b) in data.iter().zip(back.to_host_f32().iter()) {
			assert!((a - b).abs() < 1e-3, "{a} vs {b}");
		}
	}
}
