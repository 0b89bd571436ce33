use super::Grid3;
use crate::error::Result;
use crate::tensor::{Location, Shape4, Tensor};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connectivity {
	Six,
	TwentySix,
}

impl Connectivity {
	/// Neighbor offsets already visited by a forward raster scan
	/// (z increasing, then y, then x), i.e. every neighbor whose linear
	/// scan index precedes the current voxel's.
	fn backward_neighbors(self) -> &'static [(isize, isize, isize)] {
		match self {
			Connectivity::Six => &[(-1, 0, 0), (0, -1, 0), (0, 0, -1)],
			Connectivity::TwentySix => &[
				(-1, -1, -1), (-1, -1, 0), (-1, -1, 1),
				(-1, 0, -1), (-1, 0, 0), (-1, 0, 1),
				(-1, 1, -1), (-1, 1, 0), (-1, 1, 1),
				(0, -1, -1), (0, -1, 0), (0, -1, 1),
				(0, 0, -1),
			],
		}
	}
}

struct UnionFind {
	parent: Vec<u32>,
}

impl UnionFind {
	fn new(n: usize) -> Self {
		UnionFind { parent: (0..n as u32).collect() }
	}

	fn find(&mut self, mut i: u32) -> u32 {
		while self.parent[i as usize] != i {
			self.parent[i as usize] = self.parent[self.parent[i as usize] as usize];
			i = self.parent[i as usize];
		}
		i
	}

	fn union(&mut self, a: u32, b: u32) {
		let (ra, rb) = (self.find(a), self.find(b));
		if ra != rb {
			let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
			self.parent[hi as usize] = lo;
		}
	}
}

/// Two-pass union-find connected components on a binary volume.
/// Background label is 0; foreground labels are dense `1..=N`, assigned in
/// scan order (z, then y, then x) for determinism.
pub fn connected_components_3d(binary: &Tensor, channel: usize, connectivity: Connectivity) -> Result<Tensor> {
	let grid = Grid3::channel_view(binary, channel)?;
	let (z, y, x) = (grid.z, grid.y, grid.x);
	let n = z * y * x;

	let mut provisional = vec![0u32; n];
	let mut uf = UnionFind::new(n + 1); // index 0 reserved, unused as a label
	let mut next_label = 1u32;

	let is_fg = |v: f32| v != 0.0;
	let lin = |zi: usize, yi: usize, xi: usize| (zi * y + yi) * x + xi;

	// First pass: provisional labels plus union-find merges against every
	// already-scanned neighbor.
	for zi in 0..z {
		for yi in 0..y {
			for xi in 0..x {
				let here = lin(zi, yi, xi);
				if !is_fg(grid.data[here]) {
					continue;
				}

				let mut found: Option<u32> = None;
				for &(dz, dy, dx) in connectivity.backward_neighbors() {
					let (nz, ny, nx) = (zi as isize + dz, yi as isize + dy, xi as isize + dx);
					if nz < 0 || ny < 0 || nx < 0 {
						continue;
					}
					let (nz, ny, nx) = (nz as usize, ny as usize, nx as usize);
					if nz >= z || ny >= y || nx >= x {
						continue;
					}
					let neighbor = lin(nz, ny, nx);
					if !is_fg(grid.data[neighbor]) {
						continue;
					}
					let neighbor_label = provisional[neighbor];
					if neighbor_label == 0 {
						continue;
					}
					match found {
						None => {
							provisional[here] = neighbor_label;
							found = Some(neighbor_label);
						}
						Some(existing) => {
							uf.union(existing, neighbor_label);
						}
					}
				}

				if found.is_none() {
					provisional[here] = next_label;
					uf.union(next_label, next_label);
					next_label += 1;
				}
			}
		}
	}

	// Second pass: resolve to union-find roots, then relabel to a dense
	// 1..N range in first-occurrence scan order.
	let mut root_to_dense: std::collections::HashMap<u32, u32> = std::collections::HashMap::new();
	let mut dense_next = 1u32;
	let mut labels = vec![0u32; n];

	for i in 0..n {
		if provisional[i] == 0 {
			continue;
		}
		let root = uf.find(provisional[i]);
		let dense = *root_to_dense.entry(root).or_insert_with(|| {
			let d = dense_next;
			dense_next += 1;
			d
		});
		labels[i] = dense;
	}

	// The tensor façade has no u32 dtype; labels are stored f32-valued and
	// callers read them back with `.round() as u32`.
	let shape = Shape4::new(1, z as u32, y as u32, x as u32);
	Tensor::from_host_f32(labels.iter().map(|&l| l as f32).collect(), shape, Location::Host)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn labels_u32(t: &Tensor) -> Vec<u32> {
		t.to_host_f32().into_iter().map(|v| v.round() as u32).collect()
	}

	#[test]
	fn two_separate_blobs_get_two_labels() {
		let shape = Shape4::new(1, 1, 5, 5);
		let mut data = vec![0.0f32; 25];
		data[0] = 1.0; // (0,0)
		data[24] = 1.0; // (4,4), not 26-adjacent to (0,0)
		let tensor = Tensor::from_host_f32(data, shape, Location::Host).unwrap();
		let labels = connected_components_3d(&tensor, 0, Connectivity::TwentySix).unwrap();
		let vals = labels_u32(&labels);
		let max_label = *vals.iter().max().unwrap();
		assert_eq!(max_label, 2);
	}

	#[test]
	fn six_connectivity_never_exceeds_twenty_six_connectivity_count() {
		let shape = Shape4::new(1, 1, 3, 3);
		// A diagonal chessboard pattern: 26-connectivity merges diagonal
		// neighbors into one component, 6-connectivity keeps them apart.
		let data = vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0];
		let tensor = Tensor::from_host_f32(data, shape, Location::Host).unwrap();
		let l6 = connected_components_3d(&tensor, 0, Connectivity::Six).unwrap();
		let l26 = connected_components_3d(&tensor, 0, Connectivity::TwentySix).unwrap();
		let max6 = *labels_u32(&l6).iter().max().unwrap();
		let max26 = *labels_u32(&l26).iter().max().unwrap();
		assert!(max26 <= max6);
	}
}
