use rayon::prelude::*;

use super::Grid3;
use crate::error::Result;
use crate::tensor::Tensor;

/// Grayscale morphological opening (erosion then dilation) with a
/// spherical structuring element approximated by separable 1-D flat
/// min/max kernels, one per axis, each of radius `ceil(radius)` voxels.
/// The opening result is subtracted from the input and clamped to
/// non-negative, estimating and removing smooth background.
pub fn rolling_ball_background(input: &Tensor, channel: usize, radius: f32) -> Result<Tensor> {
	let grid = Grid3::channel_view(input, channel)?;
	let r = radius.ceil().max(0.0) as isize;

	let opened = if r == 0 {
		grid.clone()
	} else {
		let eroded = separable_rank(&grid, r, Rank::Min);
		separable_rank(&eroded, r, Rank::Max)
	};

	let mut out = Grid3::new(grid.z, grid.y, grid.x);
	out.data
		.par_iter_mut()
		.zip(grid.data.par_iter().zip(opened.data.par_iter()))
		.for_each(|(o, (&src, &bg))| {
			*o = (src - bg).max(0.0);
		});

	out.into_tensor(input.dtype())
}

#[derive(Clone, Copy)]
enum Rank {
	Min,
	Max,
}

impl Rank {
	fn identity(self) -> f32 {
		match self {
			Rank::Min => f32::INFINITY,
			Rank::Max => f32::NEG_INFINITY,
		}
	}

	fn combine(self, a: f32, b: f32) -> f32 {
		match self {
			Rank::Min => a.min(b),
			Rank::Max => a.max(b),
		}
	}
}

/// Applies a flat min/max kernel of the given radius along X, then Y, then
/// Z in turn; the cascade of three 1-D passes approximates an isotropic
/// spherical structuring element of that radius.
fn separable_rank(src: &Grid3, radius: isize, rank: Rank) -> Grid3 {
	let along_x = rank_x(src, radius, rank);
	let along_y = rank_y(&along_x, radius, rank);
	rank_z(&along_y, radius, rank)
}

fn rank_x(src: &Grid3, radius: isize, rank: Rank) -> Grid3 {
	let mut out = Grid3::new(src.z, src.y, src.x);
	out.data
		.par_chunks_mut(src.y * src.x)
		.enumerate()
		.for_each(|(zi, plane)| {
			for yi in 0..src.y {
				for xi in 0..src.x {
					let mut best = rank.identity();
					for d in -radius..=radius {
						best = rank.combine(best, src.get(zi as isize, yi as isize, xi as isize + d));
					}
					plane[yi * src.x + xi] = best;
				}
			}
		});
	out
}

fn rank_y(src: &Grid3, radius: isize, rank: Rank) -> Grid3 {
	let mut out = Grid3::new(src.z, src.y, src.x);
	out.data
		.par_chunks_mut(src.y * src.x)
		.enumerate()
		.for_each(|(zi, plane)| {
			for yi in 0..src.y {
				for xi in 0..src.x {
					let mut best = rank.identity();
					for d in -radius..=radius {
						best = rank.combine(best, src.get(zi as isize, yi as isize + d, xi as isize));
					}
					plane[yi * src.x + xi] = best;
				}
			}
		});
	out
}

fn rank_z(src: &Grid3, radius: isize, rank: Rank) -> Grid3 {
	let mut out = Grid3::new(src.z, src.y, src.x);
	out.data
		.par_chunks_mut(src.y * src.x)
		.enumerate()
		.for_each(|(zi, plane)| {
			for yi in 0..src.y {
				for xi in 0..src.x {
					let mut best = rank.identity();
					for d in -radius..=radius {
						best = rank.combine(best, src.get(zi as isize + d, yi as isize, xi as isize));
					}
					plane[yi * src.x + xi] = best;
				}
			}
		});
	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::tensor::{Location, Shape4};

	#[test]
	fn flat_background_is_fully_removed() {
		let shape = Shape4::new(1, 4, 8, 8);
		let data = vec![50.0f32; shape.voxels() as usize];
		let tensor = Tensor::from_host_f32(data, shape, Location::Host).unwrap();
		let out = rolling_ball_background(&tensor, 0, 3.0).unwrap();
		for v in out.to_host_f32() {
			assert!(v.abs() < 1e-3);
		}
	}

	#[test]
	fn output_is_never_negative() {
		let shape = Shape4::new(1, 4, 8, 8);
		let n = shape.voxels() as usize;
		let mut data = vec![10.0f32; n];
		data[0] = 200.0;
		let tensor = Tensor::from_host_f32(data, shape, Location::Host).unwrap();
		let out = rolling_ball_background(&tensor, 0, 2.0).unwrap();
		for v in out.to_host_f32() {
			assert!(v >= 0.0);
		}
	}
}
