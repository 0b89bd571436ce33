use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::Grid3;
use crate::error::Result;
use crate::tensor::{Location, Shape4, Tensor};

/// Priority-flood watershed from labeled markers. Floods in order of
/// increasing intensity (lower elevation first); ties are broken by FIFO
/// insertion order within the same intensity bucket, so the algorithm is
/// deterministic for a fixed input. Voxels outside `mask` are never
/// assigned a label. Uses 6-connectivity.
pub fn watershed_3d(image: &Tensor, markers: &Tensor, mask: &Tensor) -> Result<Tensor> {
	let image_grid = Grid3::channel_view(image, 0)?;
	let marker_grid = Grid3::channel_view(markers, 0)?;
	let mask_grid = Grid3::channel_view(mask, 0)?;

	let (z, y, x) = (image_grid.z, image_grid.y, image_grid.x);
	let n = z * y * x;
	let lin = |zi: usize, yi: usize, xi: usize| (zi * y + yi) * x + xi;

	let mut labels = vec![0u32; n];
	let mut heap: BinaryHeap<Entry> = BinaryHeap::new();
	let mut seq = 0u64;

	for i in 0..n {
		let label = marker_grid.data[i].round() as u32;
		if label != 0 {
			labels[i] = label;
		}
	}

	let neighbor_offsets = [(-1isize, 0isize, 0isize), (1, 0, 0), (0, -1, 0), (0, 1, 0), (0, 0, -1), (0, 0, 1)];

	let in_bounds_and_masked = |zi: isize, yi: isize, xi: isize| -> Option<usize> {
		if zi < 0 || yi < 0 || xi < 0 {
			return None;
		}
		let (zu, yu, xu) = (zi as usize, yi as usize, xi as usize);
		if zu >= z || yu >= y || xu >= x {
			return None;
		}
		let idx = lin(zu, yu, xu);
		if mask_grid.data[idx] == 0.0 {
			return None;
		}
		Some(idx)
	};

	for zi in 0..z {
		for yi in 0..y {
			for xi in 0..x {
				let i = lin(zi, yi, xi);
				if labels[i] == 0 {
					continue;
				}
				for &(dz, dy, dx) in &neighbor_offsets {
					if let Some(ni) = in_bounds_and_masked(zi as isize + dz, yi as isize + dy, xi as isize + dx) {
						if labels[ni] == 0 {
							heap.push(Entry { intensity: image_grid.data[ni], seq, index: ni, label: labels[i] });
							seq += 1;
						}
					}
				}
			}
		}
	}

	while let Some(entry) = heap.pop() {
		if labels[entry.index] != 0 {
			continue;
		}
		labels[entry.index] = entry.label;

		let zi = entry.index / (y * x);
		let rem = entry.index % (y * x);
		let yi = rem / x;
		let xi = rem % x;

		for &(dz, dy, dx) in &neighbor_offsets {
			if let Some(ni) = in_bounds_and_masked(zi as isize + dz, yi as isize + dy, xi as isize + dx) {
				if labels[ni] == 0 {
					heap.push(Entry { intensity: image_grid.data[ni], seq, index: ni, label: entry.label });
					seq += 1;
				}
			}
		}
	}

	let shape = Shape4::new(1, z as u32, y as u32, x as u32);
	Tensor::from_host_f32(labels.iter().map(|&l| l as f32).collect(), shape, Location::Host)
}

struct Entry {
	intensity: f32,
	seq: u64,
	index: usize,
	label: u32,
}

impl PartialEq for Entry {
	fn eq(&self, other: &Self) -> bool {
		self.intensity == other.intensity && self.seq == other.seq
	}
}
impl Eq for Entry {}

impl Ord for Entry {
	fn cmp(&self, other: &Self) -> Ordering {
		// `BinaryHeap` is a max-heap; reverse so the smallest intensity
		// (and, within a tie, the smallest sequence number / earliest
		// insertion) pops first.
		other
			.intensity
			.partial_cmp(&self.intensity)
			.unwrap_or(Ordering::Equal)
			.then_with(|| other.seq.cmp(&self.seq))
	}
}

impl PartialOrd for Entry {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn flood_stays_within_mask() {
		let shape = Shape4::new(1, 1, 1, 6);
		let image = Tensor::from_host_f32(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0], shape, Location::Host).unwrap();
		let markers = Tensor::from_host_f32(vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0], shape, Location::Host).unwrap();
		let mask = Tensor::from_host_f32(vec![1.0, 1.0, 1.0, 0.0, 0.0, 0.0], shape, Location::Host).unwrap();

		let out = watershed_3d(&image, &markers, &mask).unwrap();
		let labels = out.to_host_f32();
		assert_eq!(labels[0], 1.0);
		assert_eq!(labels[1], 1.0);
		assert_eq!(labels[2], 1.0);
		assert_eq!(labels[3], 0.0);
		assert_eq!(labels[4], 0.0);
		assert_eq!(labels[5], 0.0);
	}

	#[test]
	fn two_markers_split_at_equal_distance() {
		let shape = Shape4::new(1, 1, 1, 5);
		let image = Tensor::from_host_f32(vec![0.0; 5], shape, Location::Host).unwrap();
		let markers = Tensor::from_host_f32(vec![1.0, 0.0, 0.0, 0.0, 2.0], shape, Location::Host).unwrap();
		let mask = Tensor::from_host_f32(vec![1.0; 5], shape, Location::Host).unwrap();

		let out = watershed_3d(&image, &markers, &mask).unwrap();
		let labels = out.to_host_f32();
		assert_eq!(labels[0], 1.0);
		assert_eq!(labels[4], 2.0);
		assert_ne!(labels[2], 0.0);
	}
}
