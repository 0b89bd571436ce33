use rayon::prelude::*;

use super::Grid3;
use crate::error::Result;
use crate::tensor::Tensor;

/// GPU histogram + Otsu threshold search. On the accelerator this is a
/// per-threadgroup private histogram reduced by atomics into one shared
/// histogram, followed by a single parallel scan computing inter-class
/// variance at every candidate threshold; the CPU path mirrors that
/// structure with a per-chunk fold/reduce instead of atomics.
///
/// Policy: an empty image (`bins == 0` is impossible; "empty" means zero
/// voxels, unreachable for a valid [`crate::tensor::Shape4`]) returns 0. A
/// constant image returns that constant. Ties among candidate thresholds
/// are broken by the smallest threshold.
pub fn otsu_threshold(input: &Tensor, channel: usize, bins: usize) -> Result<f32> {
	let grid = Grid3::channel_view(input, channel)?;
	if grid.data.is_empty() {
		return Ok(0.0);
	}

	let (min, max) = grid
		.data
		.par_iter()
		.fold(
			|| (f32::INFINITY, f32::NEG_INFINITY),
			|(lo, hi), &v| (lo.min(v), hi.max(v)),
		)
		.reduce(
			|| (f32::INFINITY, f32::NEG_INFINITY),
			|(lo1, hi1), (lo2, hi2)| (lo1.min(lo2), hi1.max(hi2)),
		);

	if max <= min {
		return Ok(min);
	}

	let bins = bins.max(1);
	let bucket_width = (max - min) / bins as f32;

	let histogram = grid
		.data
		.par_chunks(4096.max(grid.data.len() / rayon::current_num_threads().max(1)))
		.fold(
			|| vec![0u64; bins],
			|mut local, chunk| {
				for &v in chunk {
					let mut b = ((v - min) / bucket_width) as usize;
					if b >= bins {
						b = bins - 1;
					}
					local[b] += 1;
				}
				local
			},
		)
		.reduce(
			|| vec![0u64; bins],
			|mut a, b| {
				for i in 0..bins {
					a[i] += b[i];
				}
				a
			},
		);

	let total: u64 = histogram.iter().sum();
	let total_f = total as f64;
	let bucket_center = |i: usize| min as f64 + (i as f64 + 0.5) * bucket_width as f64;

	let global_mean: f64 = histogram
		.iter()
		.enumerate()
		.map(|(i, &count)| bucket_center(i) * count as f64)
		.sum::<f64>()
		/ total_f;

	// Inter-class variance at every candidate threshold, in one parallel
	// scan over bucket boundaries (the accelerator does this as a single
	// pass once the histogram exists; sequential prefix sums here are
	// cheap enough at `bins <= 65536` that they are not worth threading).
	let mut weight_bg = 0.0f64;
	let mut sum_bg = 0.0f64;
	let mut best_variance = -1.0f64;
	let mut best_bucket = 0usize;

	for i in 0..bins {
		weight_bg += histogram[i] as f64;
		sum_bg += bucket_center(i) * histogram[i] as f64;

		let weight_fg = total_f - weight_bg;
		if weight_bg <= 0.0 || weight_fg <= 0.0 {
			continue;
		}

		let mean_bg = sum_bg / weight_bg;
		let mean_fg = (global_mean * total_f - sum_bg) / weight_fg;
		let variance = weight_bg * weight_fg * (mean_bg - mean_fg).powi(2);

		if variance > best_variance {
			best_variance = variance;
			best_bucket = i;
		}
	}

	Ok((min as f64 + (best_bucket as f64 + 1.0) * bucket_width as f64) as f32)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::tensor::{Location, Shape4};

	#[test]
	fn constant_image_returns_the_constant() {
		let shape = Shape4::new(1, 2, 2, 2);
		let tensor = Tensor::from_host_f32(vec![1000.0; 8], shape, Location::Host).unwrap();
		let t = otsu_threshold(&tensor, 0, 256).unwrap();
		assert_eq!(t, 1000.0);
	}

	#[test]
	fn bimodal_threshold_lies_between_modes() {
		let shape = Shape4::new(1, 4, 8, 8);
		let n = shape.voxels() as usize;
		let mut data = vec![0.0f32; n];
		for (i, v) in data.iter_mut().enumerate() {
			*v = if i % 2 == 0 { 100.0 } else { 3000.0 };
		}
		let tensor = Tensor::from_host_f32(data, shape, Location::Host).unwrap();
		let t = otsu_threshold(&tensor, 0, 256).unwrap();
		assert!(t > 100.0 && t < 3000.0, "threshold {t} not between modes");
	}
}
