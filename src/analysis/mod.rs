//! Analysis Ops (spec component E): per-label statistics, colocalization
//! coefficients, and per-channel intensity features.

use crate::error::{Error, Result};
use crate::kernel::{otsu_threshold, sobel_3d};
use crate::tensor::Tensor;

/// One label's statistics from [`region_stats`]. Centroid is in (z, y, x)
/// voxel coordinates, not physical units — callers scale by
/// `Metadata::voxel_size` themselves.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RegionStat {
	pub label: u32,
	pub voxel_count: u64,
	pub centroid: (f64, f64, f64),
	pub sum: f64,
	pub mean: f64,
	pub min: f64,
	pub max: f64,
	pub variance: f64,
}

/// Per-label voxel count, centroid, sum, mean, min, max, variance (spec.md
/// §4.E). A single pass accumulates count/sum/sum-of-squares/centroid per
/// label; variance is derived from the accumulated moments rather than a
/// second pass. Background label 0 is never included. An empty label set
/// (an all-background volume) returns an empty table.
pub fn region_stats(labels: &Tensor, intensity: &Tensor, channel: usize) -> Result<Vec<RegionStat>> {
	let label_shape = labels.shape();
	let intensity_shape = intensity.shape();
	if label_shape.zyx() != intensity_shape.zyx() {
		return Err(Error::shape(format!(
			"region_stats: label volume shape {label_shape:?} does not match intensity shape {intensity_shape:?}"
		)));
	}
	if channel >= intensity_shape.c as usize {
		return Err(Error::shape(format!("channel {channel} out of range for shape {intensity_shape:?}")));
	}

	let label_data: Vec<u32> = labels.to_host_f32().into_iter().map(|v| v.round() as u32).collect();
	let full_intensity = intensity.to_host_f32();
	let plane_len = (intensity_shape.z as usize) * (intensity_shape.y as usize) * (intensity_shape.x as usize);
	let start = channel * plane_len;
	let intensity_data = &full_intensity[start..start + plane_len];

	let (y, x) = (label_shape.y as usize, label_shape.x as usize);

	struct Accum {
		count: u64,
		sum: f64,
		sum_sq: f64,
		sum_z: f64,
		sum_y: f64,
		sum_x: f64,
		min: f64,
		max: f64,
	}

	let mut accum: std::collections::BTreeMap<u32, Accum> = std::collections::BTreeMap::new();

	for (i, &label) in label_data.iter().enumerate() {
		if label == 0 {
			continue;
		}
		let zi = i / (y * x);
		let rem = i % (y * x);
		let yi = rem / x;
		let xi = rem % x;
		let value = intensity_data[i] as f64;

		let entry = accum.entry(label).or_insert(Accum {
			count: 0,
			sum: 0.0,
			sum_sq: 0.0,
			sum_z: 0.0,
			sum_y: 0.0,
			sum_x: 0.0,
			min: f64::INFINITY,
			max: f64::NEG_INFINITY,
		});
		entry.count += 1;
		entry.sum += value;
		entry.sum_sq += value * value;
		entry.sum_z += zi as f64;
		entry.sum_y += yi as f64;
		entry.sum_x += xi as f64;
		entry.min = entry.min.min(value);
		entry.max = entry.max.max(value);
	}

	let stats = accum
		.into_iter()
		.map(|(label, a)| {
			let n = a.count as f64;
			let mean = a.sum / n;
			let variance = (a.sum_sq / n - mean * mean).max(0.0);
			RegionStat {
				label,
				voxel_count: a.count,
				centroid: (a.sum_z / n, a.sum_y / n, a.sum_x / n),
				sum: a.sum,
				mean,
				min: a.min,
				max: a.max,
				variance,
			}
		})
		.collect();

	Ok(stats)
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ColocalizationResult {
	pub pearson_r: f64,
	pub manders_m1: f64,
	pub manders_m2: f64,
	pub threshold_a: f32,
	pub threshold_b: f32,
}

/// Pearson's r, Manders' M1/M2 between two channels (spec.md §4.E).
/// Thresholds default to per-channel `otsu_threshold` when not supplied.
/// `mask` restricts the statistics to nonzero voxels when present,
/// otherwise the whole volume is used.
pub fn colocalization(
	channel_a: &Tensor,
	channel_b: &Tensor,
	mask: Option<&Tensor>,
	threshold_a: Option<f32>,
	threshold_b: Option<f32>,
) -> Result<ColocalizationResult> {
	if channel_a.shape().zyx() != channel_b.shape().zyx() {
		return Err(Error::shape("colocalization: channel_a and channel_b must share a (z,y,x) shape"));
	}

	let a = channel_a.to_host_f32();
	let b = channel_b.to_host_f32();
	let mask_data = mask.map(|m| m.to_host_f32());

	let indices: Vec<usize> = match &mask_data {
		Some(m) => (0..a.len()).filter(|&i| m[i] != 0.0).collect(),
		None => (0..a.len()).collect(),
	};

	if indices.is_empty() {
		return Ok(ColocalizationResult { pearson_r: 0.0, manders_m1: 0.0, manders_m2: 0.0, threshold_a: 0.0, threshold_b: 0.0 });
	}

	let threshold_a = match threshold_a {
		Some(t) => t,
		None => otsu_threshold(channel_a, 0, 256)?,
	};
	let threshold_b = match threshold_b {
		Some(t) => t,
		None => otsu_threshold(channel_b, 0, 256)?,
	};

	let n = indices.len() as f64;
	let (mut mean_a, mut mean_b) = (0.0f64, 0.0f64);
	for &i in &indices {
		mean_a += a[i] as f64;
		mean_b += b[i] as f64;
	}
	mean_a /= n;
	mean_b /= n;

	let (mut cov, mut var_a, mut var_b) = (0.0f64, 0.0f64, 0.0f64);
	for &i in &indices {
		let da = a[i] as f64 - mean_a;
		let db = b[i] as f64 - mean_b;
		cov += da * db;
		var_a += da * da;
		var_b += db * db;
	}
	let pearson_r = if var_a > 0.0 && var_b > 0.0 { cov / (var_a.sqrt() * var_b.sqrt()) } else { 0.0 };

	let (mut a_above, mut a_above_and_b_above, mut b_above, mut b_above_and_a_above) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
	for &i in &indices {
		let above_a = a[i] >= threshold_a;
		let above_b = b[i] >= threshold_b;
		if above_a {
			a_above += a[i] as f64;
			if above_b {
				a_above_and_b_above += a[i] as f64;
			}
		}
		if above_b {
			b_above += b[i] as f64;
			if above_a {
				b_above_and_a_above += b[i] as f64;
			}
		}
	}
	let manders_m1 = if a_above > 0.0 { a_above_and_b_above / a_above } else { 0.0 };
	let manders_m2 = if b_above > 0.0 { b_above_and_a_above / b_above } else { 0.0 };

	Ok(ColocalizationResult { pearson_r, manders_m1, manders_m2, threshold_a, threshold_b })
}

#[derive(Clone, Debug, PartialEq)]
pub struct IntensityStats {
	pub channel: usize,
	pub histogram: Vec<u64>,
	pub percentiles: [(u8, f64); 5],
	pub snr: f64,
}

const PERCENTILE_POINTS: [u8; 5] = [1, 5, 50, 95, 99];
const HISTOGRAM_BINS: usize = 256;
const SNR_WINDOW_RADIUS: isize = 2;

/// Per-channel histogram, percentiles, and SNR (spec.md §4.E). SNR is
/// estimated from a small neighborhood around the (y,x) location with the
/// lowest projected gradient magnitude: `sobel_3d` gives the gradient
/// volume, `Tensor::project_max` (SPEC_FULL.md §2.2) collapses it along Z so
/// the search is a cheap 2-D argmin instead of a full 3-D scan.
pub fn intensity_analysis(volume: &Tensor, channels: &[usize]) -> Result<Vec<IntensityStats>> {
	channels.iter().map(|&channel| intensity_analysis_one(volume, channel)).collect()
}

fn intensity_analysis_one(volume: &Tensor, channel: usize) -> Result<IntensityStats> {
	let shape = volume.shape();
	if channel >= shape.c as usize {
		return Err(Error::shape(format!("channel {channel} out of range for shape {shape:?}")));
	}

	let plane_len = (shape.z as usize) * (shape.y as usize) * (shape.x as usize);
	let full = volume.to_host_f32();
	let start = channel * plane_len;
	let data = &full[start..start + plane_len];

	let (min, max) = data.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
	let histogram = build_histogram(data, min, max);

	let mut sorted: Vec<f32> = data.to_vec();
	sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
	let percentiles = PERCENTILE_POINTS.map(|p| (p, percentile(&sorted, p)));

	let snr = low_gradient_snr(volume, channel)?;

	Ok(IntensityStats { channel, histogram, percentiles, snr })
}

fn build_histogram(data: &[f32], min: f32, max: f32) -> Vec<u64> {
	let mut histogram = vec![0u64; HISTOGRAM_BINS];
	if max <= min {
		histogram[0] = data.len() as u64;
		return histogram;
	}
	let bucket_width = (max - min) / HISTOGRAM_BINS as f32;
	for &v in data {
		let mut b = ((v - min) / bucket_width) as usize;
		if b >= HISTOGRAM_BINS {
			b = HISTOGRAM_BINS - 1;
		}
		histogram[b] += 1;
	}
	histogram
}

fn percentile(sorted: &[f32], p: u8) -> f64 {
	if sorted.is_empty() {
		return 0.0;
	}
	let rank = (p as f64 / 100.0) * (sorted.len() as f64 - 1.0);
	let lo = rank.floor() as usize;
	let hi = rank.ceil() as usize;
	if lo == hi {
		sorted[lo] as f64
	} else {
		let frac = rank - lo as f64;
		sorted[lo] as f64 * (1.0 - frac) + sorted[hi] as f64 * frac
	}
}

fn low_gradient_snr(volume: &Tensor, channel: usize) -> Result<f64> {
	let gradient = sobel_3d(volume, channel)?;
	let projected = gradient.project_max("z")?;
	let projected_data = projected.to_host_f32();

	let shape = volume.shape();
	let (y, x) = (shape.y as usize, shape.x as usize);
	let (mut best_idx, mut best_value) = (0usize, f32::INFINITY);
	for (i, &v) in projected_data.iter().enumerate() {
		if v < best_value {
			best_value = v;
			best_idx = i;
		}
	}
	let (cy, cx) = (best_idx / x, best_idx % x);

	let plane_len = (shape.z as usize) * y * x;
	let full = volume.to_host_f32();
	let start = channel * plane_len;
	let data = &full[start..start + plane_len];

	let mut samples = Vec::new();
	for zi in 0..shape.z as usize {
		for dy in -SNR_WINDOW_RADIUS..=SNR_WINDOW_RADIUS {
			for dx in -SNR_WINDOW_RADIUS..=SNR_WINDOW_RADIUS {
				let (yi, xi) = (cy as isize + dy, cx as isize + dx);
				if yi < 0 || xi < 0 || yi as usize >= y || xi as usize >= x {
					continue;
				}
				let idx = (zi * y + yi as usize) * x + xi as usize;
				samples.push(data[idx] as f64);
			}
		}
	}

	if samples.is_empty() {
		return Ok(0.0);
	}
	let n = samples.len() as f64;
	let mean = samples.iter().sum::<f64>() / n;
	let variance = samples.iter().map(|&v| (v - mean).powi(2)).sum::<f64>() / n;
	let stddev = variance.sqrt();

	Ok(if stddev > 0.0 { mean / stddev } else { 0.0 })
}
