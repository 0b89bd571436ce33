//! Deconvolution (spec component F): PSF synthesis, Richardson-Lucy
//! iteration, and single-shot Wiener inversion, all built on FFT-based
//! convolution over the kernel library's `Grid3`/`Complex3` primitives.

use std::sync::{Arc, Mutex, OnceLock};

use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

use crate::error::{Error, Result};
use crate::kernel::fft::{good_transform_size, Direction};
use crate::kernel::{Complex3, Grid3};
use crate::tensor::{Location, Shape4, Tensor};

const CACHE_CAPACITY: usize = 16;

/// Bounded write-through cache, LRU by entry count (SPEC_FULL.md §2.2): a
/// hit moves the entry to the back, a miss evicts the front before
/// inserting. `CACHE_CAPACITY` is small enough that a linear scan is
/// cheaper than a real LRU structure.
struct BoundedCache<K, V> {
	entries: Vec<(K, V)>,
}

impl<K: PartialEq, V: Clone> BoundedCache<K, V> {
	fn new() -> Self {
		BoundedCache { entries: Vec::new() }
	}

	fn get_or_insert_with(&mut self, key: K, make: impl FnOnce() -> V) -> V {
		if let Some(pos) = self.entries.iter().position(|(k, _)| k == &key) {
			let (_, value) = self.entries.remove(pos);
			self.entries.push((key, value.clone()));
			return value;
		}
		let value = make();
		if self.entries.len() >= CACHE_CAPACITY {
			self.entries.remove(0);
		}
		self.entries.push((key, value.clone()));
		value
	}
}

type PlanKey = (usize, bool);

fn plan_cache() -> &'static Mutex<BoundedCache<PlanKey, Arc<dyn Fft<f32>>>> {
	static CACHE: OnceLock<Mutex<BoundedCache<PlanKey, Arc<dyn Fft<f32>>>>> = OnceLock::new();
	CACHE.get_or_init(|| Mutex::new(BoundedCache::new()))
}

fn cached_plan(planner: &mut FftPlanner<f32>, len: usize, dir: Direction) -> Arc<dyn Fft<f32>> {
	let key = (len, matches!(dir, Direction::Forward));
	let mut cache = plan_cache().lock().unwrap_or_else(|e| e.into_inner());
	cache.get_or_insert_with(key, || match dir {
		Direction::Forward => planner.plan_fft_forward(len),
		Direction::Inverse => planner.plan_fft_inverse(len),
	})
}

fn transform(vol: &mut Complex3, dir: Direction) {
	let mut planner = FftPlanner::<f32>::new();
	transform_axis_x(vol, &mut planner, dir);
	transform_axis_y(vol, &mut planner, dir);
	transform_axis_z(vol, &mut planner, dir);
}

fn transform_axis_x(vol: &mut Complex3, planner: &mut FftPlanner<f32>, dir: Direction) {
	let fft = cached_plan(planner, vol.x, dir);
	for zi in 0..vol.z {
		for yi in 0..vol.y {
			let start = (zi * vol.y + yi) * vol.x;
			fft.process(&mut vol.data[start..start + vol.x]);
		}
	}
}

fn transform_axis_y(vol: &mut Complex3, planner: &mut FftPlanner<f32>, dir: Direction) {
	let fft = cached_plan(planner, vol.y, dir);
	let mut line = vec![Complex32::new(0.0, 0.0); vol.y];
	for zi in 0..vol.z {
		for xi in 0..vol.x {
			for (yi, slot) in line.iter_mut().enumerate() {
				*slot = vol.data[(zi * vol.y + yi) * vol.x + xi];
			}
			fft.process(&mut line);
			for (yi, &slot) in line.iter().enumerate() {
				vol.data[(zi * vol.y + yi) * vol.x + xi] = slot;
			}
		}
	}
}

fn transform_axis_z(vol: &mut Complex3, planner: &mut FftPlanner<f32>, dir: Direction) {
	let fft = cached_plan(planner, vol.z, dir);
	let mut line = vec![Complex32::new(0.0, 0.0); vol.z];
	for yi in 0..vol.y {
		for xi in 0..vol.x {
			for (zi, slot) in line.iter_mut().enumerate() {
				*slot = vol.data[(zi * vol.y + yi) * vol.x + xi];
			}
			fft.process(&mut line);
			for (zi, &slot) in line.iter().enumerate() {
				vol.data[(zi * vol.y + yi) * vol.x + xi] = slot;
			}
		}
	}
}

fn target_shape(shape: (usize, usize, usize)) -> (usize, usize, usize) {
	(good_transform_size(shape.0), good_transform_size(shape.1), good_transform_size(shape.2))
}

fn wrap(i: isize, len: usize) -> usize {
	i.rem_euclid(len as isize) as usize
}

/// Zero-pads `grid` into a `target`-shaped spectrum. `center_origin` wraps
/// the grid's center to index 0 (the placement a convolution kernel needs
/// so its response lands centered on the source voxel); otherwise the grid
/// is corner-aligned, the placement a signal needs.
///
/// `target` is sized to the image's own good-transform-size, not
/// `image + psf - 1`; for a PSF whose support is a large fraction of the
/// volume this circular convolution wraps around the volume boundary. PSFs
/// in this domain are small relative to a Z-stack, so this is an accepted
/// approximation rather than a full linear-convolution padding scheme.
fn place(grid: &Grid3, target: (usize, usize, usize), center_origin: bool) -> Complex3 {
	let (tz, ty, tx) = target;
	let mut out = Complex3::zeros(tz, ty, tx);
	for zi in 0..grid.z {
		for yi in 0..grid.y {
			for xi in 0..grid.x {
				let (dz, dy, dx) = if center_origin {
					(
						wrap(zi as isize - grid.z as isize / 2, tz),
						wrap(yi as isize - grid.y as isize / 2, ty),
						wrap(xi as isize - grid.x as isize / 2, tx),
					)
				} else {
					(zi, yi, xi)
				};
				let src = (zi * grid.y + yi) * grid.x + xi;
				let dst = (dz * ty + dy) * tx + dx;
				out.data[dst] = Complex32::new(grid.data[src], 0.0);
			}
		}
	}
	out
}

fn crop_real(vol: &Complex3, shape: (usize, usize, usize)) -> Grid3 {
	let scale = 1.0 / (vol.z * vol.y * vol.x) as f32;
	let (oz, oy, ox) = shape;
	let mut out = Grid3::new(oz, oy, ox);
	for zi in 0..oz {
		for yi in 0..oy {
			for xi in 0..ox {
				let src = (zi * vol.y + yi) * vol.x + xi;
				let dst = (zi * oy + yi) * ox + xi;
				out.data[dst] = vol.data[src].re * scale;
			}
		}
	}
	out
}

/// FFT-based circular convolution of `image` with a (center-origin) `psf`.
fn convolve(image: &Grid3, psf: &Grid3) -> Grid3 {
	let target = target_shape((image.z, image.y, image.x));
	let mut image_freq = place(image, target, false);
	let mut psf_freq = place(psf, target, true);
	transform(&mut image_freq, Direction::Forward);
	transform(&mut psf_freq, Direction::Forward);
	let mut product = image_freq.multiply_elementwise(&psf_freq);
	transform(&mut product, Direction::Inverse);
	crop_real(&product, (image.z, image.y, image.x))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct PsfCacheKey {
	na_bits: u32,
	wavelength_bits: u32,
	voxel_bits: (u64, u64, u64),
	shape: (usize, usize, usize),
}

fn psf_cache() -> &'static Mutex<BoundedCache<PsfCacheKey, Vec<f32>>> {
	static CACHE: OnceLock<Mutex<BoundedCache<PsfCacheKey, Vec<f32>>>> = OnceLock::new();
	CACHE.get_or_init(|| Mutex::new(BoundedCache::new()))
}

/// Gaussian-PSF synthesis parameters (spec.md §4.F): numerical aperture,
/// emission wavelength, and the voxel spacing the PSF is discretized at, in
/// (z, y, x) micrometers.
#[derive(Clone, Copy, Debug)]
pub struct PsfParams {
	pub na: f32,
	pub wavelength_nm: f32,
	pub voxel_size_um: (f64, f64, f64),
	pub shape: (usize, usize, usize),
}

/// Synthesizes a Gaussian approximation of a widefield/confocal PSF from
/// NA + wavelength + voxel spacing. Lateral and axial sigmas follow the
/// standard diffraction-limited approximations (`0.21 λ / NA` lateral,
/// `0.66 λ / NA²` axial), then convert to voxel units via the caller's
/// voxel spacing. Cached by `(na, wavelength, voxel size, shape)` per
/// SPEC_FULL.md §2.2.
pub fn synthesize_gaussian_psf(params: &PsfParams) -> Result<Tensor> {
	if !(params.na > 0.0) || !(params.wavelength_nm > 0.0) {
		return Err(Error::invalid_parameter("na", "numerical aperture and wavelength must be positive"));
	}
	let (vz, vy, vx) = params.voxel_size_um;
	if !(vz > 0.0 && vy > 0.0 && vx > 0.0) {
		return Err(Error::invalid_parameter("voxel_size_um", "voxel spacing must be positive"));
	}
	let (dz, dy, dx) = params.shape;
	if dz == 0 || dy == 0 || dx == 0 {
		return Err(Error::shape("PSF shape must be non-empty in all axes"));
	}

	let key = PsfCacheKey {
		na_bits: params.na.to_bits(),
		wavelength_bits: params.wavelength_nm.to_bits(),
		voxel_bits: (vz.to_bits(), vy.to_bits(), vx.to_bits()),
		shape: params.shape,
	};

	let data = {
		let mut cache = psf_cache().lock().unwrap_or_else(|e| e.into_inner());
		cache.get_or_insert_with(key, || gaussian_psf_data(params))
	};

	let shape = Shape4::new(1, dz as u32, dy as u32, dx as u32);
	Tensor::from_host_f32(data, shape, Location::Host)
}

fn gaussian_psf_data(params: &PsfParams) -> Vec<f32> {
	let wavelength_um = params.wavelength_nm as f64 / 1000.0;
	let na = params.na as f64;
	let sigma_lateral_um = 0.21 * wavelength_um / na;
	let sigma_axial_um = 0.66 * wavelength_um / (na * na);

	let (vz, vy, vx) = params.voxel_size_um;
	let sigma_z = ((sigma_axial_um / vz) as f32).max(1e-3);
	let sigma_y = ((sigma_lateral_um / vy) as f32).max(1e-3);
	let sigma_x = ((sigma_lateral_um / vx) as f32).max(1e-3);

	let (dz, dy, dx) = params.shape;
	let (cz, cy, cx) = (dz as f32 / 2.0, dy as f32 / 2.0, dx as f32 / 2.0);

	let mut data = vec![0.0f32; dz * dy * dx];
	let mut sum = 0.0f32;
	for zi in 0..dz {
		for yi in 0..dy {
			for xi in 0..dx {
				let ddz = (zi as f32 - cz) / sigma_z;
				let ddy = (yi as f32 - cy) / sigma_y;
				let ddx = (xi as f32 - cx) / sigma_x;
				let v = (-0.5 * (ddz * ddz + ddy * ddy + ddx * ddx)).exp();
				data[(zi * dy + yi) * dx + xi] = v;
				sum += v;
			}
		}
	}
	if sum > 0.0 {
		data.iter_mut().for_each(|v| *v /= sum);
	}
	data
}

/// Normalizes a caller-supplied PSF volume to unit sum, the precondition
/// `richardson_lucy`/`wiener` both require (spec.md §4.F).
pub fn normalize_psf(psf: &Tensor) -> Result<Tensor> {
	let data = psf.to_host_f32();
	let sum: f32 = data.iter().sum();
	if !(sum > 0.0) {
		return Err(Error::invalid_parameter("psf", "PSF must have a positive sum to normalize"));
	}
	let normalized: Vec<f32> = data.iter().map(|v| v / sum).collect();
	Tensor::from_host_f32(normalized, psf.shape(), psf.location())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Regularization {
	None,
	Tv,
}

#[derive(Clone, Copy, Debug)]
pub struct RichardsonLucyParams {
	pub iterations: u32,
	pub regularization: Regularization,
	pub lambda_tv: f32,
	pub tol: f32,
}

impl Default for RichardsonLucyParams {
	fn default() -> Self {
		RichardsonLucyParams { iterations: 20, regularization: Regularization::None, lambda_tv: 0.01, tol: 1e-4 }
	}
}

#[derive(Clone, Debug)]
pub struct RichardsonLucyOutput {
	pub volume: Tensor,
	pub final_relative_change: f32,
}

/// Classic Richardson-Lucy update with FFT-based convolutions (spec.md
/// §4.F): `estimate *= conv(image / conv(estimate, psf), psf)` per
/// iteration (PSFs from [`synthesize_gaussian_psf`] are symmetric, so
/// correlation and convolution coincide and no kernel flip is needed).
/// Stops early once the relative change between iterations drops below
/// `tol`. Non-negativity is enforced after every update.
pub fn richardson_lucy(image: &Tensor, psf: &Tensor, params: &RichardsonLucyParams) -> Result<RichardsonLucyOutput> {
	if params.iterations == 0 {
		return Err(Error::invalid_parameter("iterations", "richardson_lucy needs at least one iteration"));
	}

	let image_grid = Grid3::channel_view(image, 0)?;
	let psf_grid = unit_sum_grid(psf)?;

	let mut estimate = image_grid.clone();
	let epsilon = 1e-6f32;
	let mut final_relative_change = 0.0f32;

	for _ in 0..params.iterations {
		let conv_estimate = convolve(&estimate, &psf_grid);
		let mut ratio = Grid3::new(image_grid.z, image_grid.y, image_grid.x);
		for i in 0..ratio.data.len() {
			ratio.data[i] = image_grid.data[i] / (conv_estimate.data[i] + epsilon);
		}
		let correction = convolve(&ratio, &psf_grid);

		let mut next = Grid3::new(estimate.z, estimate.y, estimate.x);
		let mut sum_abs_change = 0.0f64;
		let mut sum_prev = 0.0f64;
		for i in 0..next.data.len() {
			let updated = (estimate.data[i] * correction.data[i]).max(0.0);
			sum_abs_change += (updated - estimate.data[i]).abs() as f64;
			sum_prev += estimate.data[i].abs() as f64;
			next.data[i] = updated;
		}

		if params.regularization == Regularization::Tv {
			apply_tv_step(&mut next, params.lambda_tv);
		}

		final_relative_change = if sum_prev > 0.0 { (sum_abs_change / sum_prev) as f32 } else { 0.0 };
		estimate = next;

		if final_relative_change < params.tol {
			break;
		}
	}

	let volume = estimate.into_tensor(image.dtype())?;
	Ok(RichardsonLucyOutput { volume, final_relative_change })
}

fn unit_sum_grid(psf: &Tensor) -> Result<Grid3> {
	let grid = Grid3::channel_view(psf, 0)?;
	let sum: f32 = grid.data.iter().sum();
	if !(sum > 0.0) {
		return Err(Error::invalid_parameter("psf", "PSF must have a positive sum"));
	}
	Ok(Grid3 { z: grid.z, y: grid.y, x: grid.x, data: grid.data.iter().map(|v| v / sum).collect() })
}

/// One explicit-gradient-descent step of isotropic total-variation
/// regularization: `u *= 1 + lambda * div(grad(u) / |grad(u)|)`, the
/// standard TV term added to Richardson-Lucy (Dey et al. 2006) to suppress
/// noise amplification across iterations.
fn apply_tv_step(grid: &mut Grid3, lambda: f32) {
	if !(lambda > 0.0) {
		return;
	}
	let original = grid.clone();
	for zi in 0..grid.z as isize {
		for yi in 0..grid.y as isize {
			for xi in 0..grid.x as isize {
				let gx = (original.get(zi, yi, xi + 1) - original.get(zi, yi, xi - 1)) / 2.0;
				let gy = (original.get(zi, yi + 1, xi) - original.get(zi, yi - 1, xi)) / 2.0;
				let gz = (original.get(zi + 1, yi, xi) - original.get(zi - 1, yi, xi)) / 2.0;
				let grad_norm = (gx * gx + gy * gy + gz * gz).sqrt().max(1e-6);

				let laplacian = original.get(zi + 1, yi, xi) + original.get(zi - 1, yi, xi) + original.get(zi, yi + 1, xi) + original.get(zi, yi - 1, xi) + original.get(zi, yi, xi + 1) + original.get(zi, yi, xi - 1) - 6.0 * original.get(zi, yi, xi);
				let divergence = laplacian / grad_norm;

				let idx = (zi as usize * grid.y + yi as usize) * grid.x + xi as usize;
				grid.data[idx] = (original.data[idx] * (1.0 + lambda * divergence)).max(0.0);
			}
		}
	}
}

/// Single-shot Wiener deconvolution (spec.md §4.F):
/// `estimate = ifft(fft(image) * conj(H) / (|H|^2 + noise_power))`.
pub fn wiener(image: &Tensor, psf: &Tensor, noise_power: f32) -> Result<Tensor> {
	if noise_power < 0.0 {
		return Err(Error::invalid_parameter("noise_power", "noise power must be non-negative"));
	}

	let image_grid = Grid3::channel_view(image, 0)?;
	let psf_grid = unit_sum_grid(psf)?;

	let target = target_shape((image_grid.z, image_grid.y, image_grid.x));
	let mut image_freq = place(&image_grid, target, false);
	let mut psf_freq = place(&psf_grid, target, true);
	transform(&mut image_freq, Direction::Forward);
	transform(&mut psf_freq, Direction::Forward);

	let mut result = Complex3::zeros(target.0, target.1, target.2);
	for i in 0..result.data.len() {
		let h = psf_freq.data[i];
		let wiener_filter = h.conj() / (h.norm_sqr() + noise_power);
		result.data[i] = image_freq.data[i] * wiener_filter;
	}
	transform(&mut result, Direction::Inverse);

	let grid = crop_real(&result, (image_grid.z, image_grid.y, image_grid.x));
	grid.into_tensor(image.dtype())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::tensor::{Location, Shape4};

	#[test]
	fn psf_synthesis_normalizes_to_unit_sum() {
		let params = PsfParams { na: 1.2, wavelength_nm: 525.0, voxel_size_um: (0.3, 0.1, 0.1), shape: (9, 15, 15) };
		let psf = synthesize_gaussian_psf(&params).unwrap();
		let sum: f32 = psf.to_host_f32().iter().sum();
		assert!((sum - 1.0).abs() < 1e-3);
	}

	#[test]
	fn richardson_lucy_preserves_total_intensity_and_nonnegativity() {
		let shape = Shape4::new(1, 8, 16, 16);
		let mut data = vec![10.0f32; shape.voxels() as usize];
		data[8 * 8 * 16 + 8 * 16 + 8] = 500.0;
		let image = Tensor::from_host_f32(data.clone(), shape, Location::Host).unwrap();

		let psf_params = PsfParams { na: 1.2, wavelength_nm: 525.0, voxel_size_um: (0.3, 0.1, 0.1), shape: (5, 7, 7) };
		let psf = synthesize_gaussian_psf(&psf_params).unwrap();

		let params = RichardsonLucyParams { iterations: 5, ..Default::default() };
		let output = richardson_lucy(&image, &psf, &params).unwrap();

		let input_sum: f32 = data.iter().sum();
		let output_sum: f32 = output.volume.to_host_f32().iter().sum();
		assert!((output_sum - input_sum).abs() / input_sum < 1e-2);
		assert!(output.volume.to_host_f32().iter().all(|&v| v >= 0.0));
	}

	#[test]
	fn richardson_lucy_rejects_zero_iterations() {
		let shape = Shape4::new(1, 2, 2, 2);
		let image = Tensor::from_host_f32(vec![1.0; 8], shape, Location::Host).unwrap();
		let psf = Tensor::from_host_f32(vec![1.0; 8], shape, Location::Host).unwrap();
		let params = RichardsonLucyParams { iterations: 0, ..Default::default() };
		let err = richardson_lucy(&image, &psf, &params).unwrap_err();
		assert!(matches!(err, Error::InvalidParameter { .. }));
	}

	#[test]
	fn wiener_with_delta_psf_is_near_identity() {
		let shape = Shape4::new(1, 4, 8, 8);
		let n = shape.voxels() as usize;
		let data: Vec<f32> = (0..n).map(|i| (i % 11) as f32).collect();
		let image = Tensor::from_host_f32(data.clone(), shape, Location::Host).unwrap();

		let mut psf_data = vec![0.0f32; n];
		psf_data[(4 / 2) * 8 * 8 + (8 / 2) * 8 + 8 / 2] = 1.0;
		let psf = Tensor::from_host_f32(psf_data, shape, Location::Host).unwrap();

		let out = wiener(&image, &psf, 1e-4).unwrap();
		for (a, b) in data.iter().zip(out.to_host_f32().iter()) {
			assert!((a - b).abs() < 0.5, "{a} vs {b}");
		}
	}
}
