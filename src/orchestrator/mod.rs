//! Analysis Orchestrator (spec component I): dispatches one of the four
//! named pipelines, composing kernels from [`crate::kernel`],
//! [`crate::segmentation`], [`crate::analysis`], and [`crate::deconv`],
//! emits progress, and aggregates a structured [`AnalysisResult`].
//!
//! State machine (spec.md §4.I): `INIT -> VALIDATE_PARAMS -> PLAN_TILING ->
//! STAGE_1 -> .. -> STAGE_N -> AGGREGATE -> DONE`, with cancellation
//! checked at every stage and tile boundary.

pub mod params;
pub mod progress;

use crate::analysis::{colocalization, intensity_analysis, region_stats, ColocalizationResult, IntensityStats, RegionStat};
use crate::config;
use crate::deconv::{self, PsfParams, RichardsonLucyParams};
use crate::device::DeviceManager;
use crate::error::{Error, Result};
use crate::kernel::{connected_components_3d, gaussian_3d, gaussian_half_width, otsu_threshold, rolling_ball_background};
use crate::metadata::Metadata;
use crate::planner::{self, TilePlan, TileView};
use crate::segmentation::filter_small_objects;
use crate::tensor::{DType, Location, Shape4, Tensor};

pub use params::{Algorithm, ColocalizationParams, DeconvolutionParams, IntensityAnalysisParams, Parameters, PsfSource, Regularization, Segmentation3dParams};
pub use progress::{CancelToken, ChannelSink, DiscardSink, ProgressEvent, ProgressSink, StderrSink};

use progress::ThrottledEmitter;

/// One request to [`run`]: the algorithm-specific parameters plus whether
/// derived volumes (label maps, masks, deconvolved volumes) should be
/// included in the result (spec.md §6).
#[derive(Clone, Debug)]
pub struct AnalysisRequest {
	pub request_id: String,
	pub parameters: Parameters,
	pub emit_volumes: bool,
}

/// Per-algorithm numeric output (spec.md §6's "Result artifact").
#[derive(Clone, Debug)]
pub enum AnalysisOutput {
	Segmentation3d { objects: Vec<RegionStat>, threshold: f32 },
	Colocalization(ColocalizationResult),
	IntensityAnalysis(Vec<IntensityStats>),
	Deconvolution { final_relative_change: f32 },
}

/// Structured result artifact (spec.md §3/§6). `confidence_score` is
/// always finite and in `[0, 1]`.
#[derive(Clone, Debug)]
pub struct AnalysisResult {
	pub request_id: String,
	pub algorithm: Algorithm,
	pub parameters: Parameters,
	pub stage_durations_ms: Vec<(String, f64)>,
	pub output: AnalysisOutput,
	pub confidence_score: f32,
	pub derived_volumes: Vec<(String, Tensor)>,
}

struct Stage {
	name: &'static str,
	weight: f32,
}

fn stages_for(algorithm: Algorithm) -> &'static [Stage] {
	match algorithm {
		Algorithm::Segmentation3d => &[
			Stage { name: "blur", weight: 0.15 },
			Stage { name: "background", weight: 0.15 },
			Stage { name: "threshold", weight: 0.10 },
			Stage { name: "components", weight: 0.35 },
			Stage { name: "stats", weight: 0.25 },
		],
		Algorithm::Colocalization => &[Stage { name: "prepare", weight: 0.2 }, Stage { name: "statistics", weight: 0.8 }],
		Algorithm::IntensityAnalysis => &[Stage { name: "histogram_percentiles", weight: 1.0 }],
		Algorithm::Deconvolution => &[Stage { name: "psf_preparation", weight: 0.1 }, Stage { name: "iterate", weight: 0.9 }],
	}
}

/// Cumulative fraction at the end of stage index `i` (0-based), per
/// spec.md §4.I: `fraction after stage k = sum_{i<=k} w_i`.
fn cumulative_weight(stages: &[Stage], up_to_index: usize) -> f32 {
	stages[..=up_to_index].iter().map(|s| s.weight).sum()
}

/// Runs one analysis request to completion (spec.md §4.I's public
/// contract). Never returns a partial `AnalysisResult`: any error or
/// observed cancellation releases all intermediate tensors and returns
/// before `AGGREGATE`.
pub fn run(
	volume: &Tensor,
	metadata: &Metadata,
	device: &DeviceManager,
	request: &AnalysisRequest,
	progress: &dyn ProgressSink,
	cancel: &CancelToken,
) -> Result<AnalysisResult> {
	log::debug!("orchestrator: INIT request={} algorithm={}", request.request_id, request.parameters.algorithm().name());

	// VALIDATE_PARAMS
	metadata.validate()?;
	request.parameters.validate()?;

	let algorithm = request.parameters.algorithm();
	let stages = stages_for(algorithm);
	let mut emitter = ThrottledEmitter::new(progress, request.request_id.clone(), algorithm.name());
	emitter.emit(stages[0].name, 0.0, true);

	if cancel.is_cancelled() {
		return Err(Error::Cancelled);
	}

	let mut stage_durations_ms = Vec::with_capacity(stages.len());
	let outcome = match &request.parameters {
		Parameters::Segmentation3d(p) => run_segmentation(volume, device, p, stages, &mut emitter, cancel, &mut stage_durations_ms),
		Parameters::Colocalization(p) => run_colocalization(volume, p, stages, &mut emitter, cancel, &mut stage_durations_ms),
		Parameters::IntensityAnalysis(p) => run_intensity_analysis(volume, p, stages, &mut emitter, cancel, &mut stage_durations_ms),
		Parameters::Deconvolution(p) => run_deconvolution(volume, metadata, p, stages, &mut emitter, cancel, &mut stage_durations_ms),
	};

	let (output, confidence_score, derived_volumes) = match outcome {
		Ok(v) => v,
		Err(e) => {
			log::warn!("orchestrator: request={} failed: {e}", request.request_id);
			return Err(e);
		}
	};

	// AGGREGATE / DONE
	emitter.emit("done", 1.0, true);
	log::debug!("orchestrator: DONE request={}", request.request_id);

	Ok(AnalysisResult {
		request_id: request.request_id.clone(),
		algorithm,
		parameters: request.parameters.clone(),
		stage_durations_ms,
		output,
		confidence_score,
		derived_volumes: if request.emit_volumes { derived_volumes } else { Vec::new() },
	})
}

fn check_cancel(cancel: &CancelToken) -> Result<()> {
	if cancel.is_cancelled() {
		Err(Error::Cancelled)
	} else {
		Ok(())
	}
}

fn timed<T>(name: &str, durations: &mut Vec<(String, f64)>, f: impl FnOnce() -> Result<T>) -> Result<T> {
	let start = std::time::Instant::now();
	let result = f();
	durations.push((name.to_string(), start.elapsed().as_secs_f64() * 1000.0));
	result
}

const SEGMENTATION_WORKING_SET_MULTIPLIER: f32 = 3.0;

/// Isotropic voxel spacing assumed for PSF synthesis when the caller's
/// metadata doesn't carry physical voxel size.
const DEFAULT_VOXEL_SIZE_UM: f64 = 1.0;

fn run_segmentation(
	volume: &Tensor,
	device: &DeviceManager,
	params: &Segmentation3dParams,
	stages: &[Stage],
	emitter: &mut ThrottledEmitter,
	cancel: &CancelToken,
	durations: &mut Vec<(String, f64)>,
) -> Result<(AnalysisOutput, f32, Vec<(String, Tensor)>)> {
	let shape = volume.shape();
	let halo_radius = gaussian_half_width(params.sigma).max(params.rolling_ball_radius as usize) as u32;
	let halo = (halo_radius, halo_radius, halo_radius);

	let plan = planner::plan_tiling(
		shape,
		DType::F32.size_bytes(),
		SEGMENTATION_WORKING_SET_MULTIPLIER,
		device.memory_budget(),
		halo,
		config::tile_hints(),
	)?;

	// STAGE: blur (tileable local kernel)
	check_cancel(cancel)?;
	let blurred = timed("blur", durations, || apply_tiled(volume, &plan, |t| gaussian_3d(t, 0, (params.sigma, params.sigma, params.sigma))))?;
	emitter.emit("blur", cumulative_weight(stages, 0), true);

	// STAGE: background (tileable local kernel)
	check_cancel(cancel)?;
	let background_removed = timed("background", durations, || apply_tiled(&blurred, &plan, |t| rolling_ball_background(t, 0, params.rolling_ball_radius as f32)))?;
	emitter.emit("background", cumulative_weight(stages, 1), true);

	// STAGE: threshold (global reduction, runs on the reassembled volume)
	check_cancel(cancel)?;
	let threshold = timed("threshold", durations, || otsu_threshold(&background_removed, 0, 256))?;
	emitter.emit("threshold", cumulative_weight(stages, 2), true);

	// STAGE: components (global connectivity, cannot be correctly tiled
	// with a halo-crop scheme; see DESIGN.md)
	check_cancel(cancel)?;
	let (labels, object_count) = timed("components", durations, || {
		let binary_data: Vec<f32> = background_removed.to_host_f32().into_iter().map(|v| if v >= threshold { 1.0 } else { 0.0 }).collect();
		let binary = Tensor::from_host_f32(binary_data, background_removed.shape(), Location::Host)?;
		let raw_labels = connected_components_3d(&binary, 0, params.connectivity)?;
		filter_small_objects(&raw_labels, params.min_object_voxels)
	})?;
	emitter.emit("components", cumulative_weight(stages, 3), true);

	// STAGE: stats
	check_cancel(cancel)?;
	let objects = timed("stats", durations, || region_stats(&labels, volume, 0))?;
	emitter.emit("stats", cumulative_weight(stages, 4), true);

	let confidence_score = segmentation_confidence(&background_removed, threshold, &objects, labels.shape().voxels());

	let mut derived = Vec::new();
	derived.push(("label_map".to_string(), labels));

	Ok((AnalysisOutput::Segmentation3d { objects, threshold }, confidence_score, derived))
}

/// Confidence heuristic for segmentation_3d (spec.md §4.I): relative
/// contrast between foreground and background mean after Otsu, scaled by
/// the fraction of voxels belonging to the largest connected component.
/// Fixed reduction order (iterate labels in ascending id) so the score is
/// stable across runs for identical input, resolving the Open Question in
/// spec.md §9 in favor of determinism.
fn segmentation_confidence(intensity: &Tensor, threshold: f32, objects: &[RegionStat], total_voxels: u64) -> f32 {
	if objects.is_empty() {
		return 0.0;
	}

	let data = intensity.to_host_f32();
	let (mut fg_sum, mut fg_n, mut bg_sum, mut bg_n) = (0.0f64, 0u64, 0.0f64, 0u64);
	for &v in &data {
		if v as f32 >= threshold {
			fg_sum += v as f64;
			fg_n += 1;
		} else {
			bg_sum += v as f64;
			bg_n += 1;
		}
	}
	if fg_n == 0 || bg_n == 0 {
		return 0.0;
	}
	let fg_mean = fg_sum / fg_n as f64;
	let bg_mean = bg_sum / bg_n as f64;
	let denom = fg_mean.abs().max(1e-9);
	let relative_contrast = ((fg_mean - bg_mean) / denom).clamp(0.0, 1.0);

	let largest = objects.iter().map(|o| o.voxel_count).max().unwrap_or(0);
	let fraction_largest = if total_voxels > 0 { largest as f64 / total_voxels as f64 } else { 0.0 };

	(relative_contrast * fraction_largest.clamp(0.0, 1.0)) as f32
}

fn run_colocalization(
	volume: &Tensor,
	params: &ColocalizationParams,
	stages: &[Stage],
	emitter: &mut ThrottledEmitter,
	cancel: &CancelToken,
	durations: &mut Vec<(String, f64)>,
) -> Result<(AnalysisOutput, f32, Vec<(String, Tensor)>)> {
	let shape = volume.shape();
	if params.channel_a as u32 >= shape.c || params.channel_b as u32 >= shape.c {
		return Err(Error::shape(format!("channel indices ({}, {}) out of range for {} channels", params.channel_a, params.channel_b, shape.c)));
	}

	let channel_tensor = |channel: u32| -> Result<Tensor> {
		let plane = (shape.z as usize) * (shape.y as usize) * (shape.x as usize);
		let full = volume.to_host_f32();
		let start = channel as usize * plane;
		Tensor::from_host_f32(full[start..start + plane].to_vec(), Shape4::new(1, shape.z, shape.y, shape.x), Location::Host)
	};

	check_cancel(cancel)?;
	let a = timed("prepare", durations, || channel_tensor(params.channel_a))?;
	let b = channel_tensor(params.channel_b)?;

	let mask = if params.mask_from_labels {
		let seg_params = crate::segmentation::SegmentationParams::default();
		let out = crate::segmentation::segmentation_3d(&a, 0, &seg_params)?;
		Some(out.labels)
	} else {
		None
	};
	emitter.emit("prepare", cumulative_weight(stages, 0), true);

	check_cancel(cancel)?;
	let result = timed("statistics", durations, || colocalization(&a, &b, mask.as_ref(), params.threshold_a, params.threshold_b))?;
	emitter.emit("statistics", cumulative_weight(stages, 1), true);

	let confidence_score = colocalization_confidence(result.pearson_r);

	let mut derived = Vec::new();
	if let Some(m) = mask {
		derived.push(("coloc_mask".to_string(), m));
	}

	Ok((AnalysisOutput::Colocalization(result), confidence_score, derived))
}

/// Confidence heuristic for colocalization (spec.md §4.I): `1 - sigma(r)`
/// where `sigma` penalizes `|r| < 0.1`. Resolved here as a clamp to zero
/// below that cutoff, scaling linearly with `|r|` above it, so confidence
/// tracks the strength of the correlation once it clears the noise floor.
fn colocalization_confidence(pearson_r: f64) -> f32 {
	let abs_r = pearson_r.abs();
	if abs_r < 0.1 {
		0.0
	} else {
		abs_r.clamp(0.0, 1.0) as f32
	}
}

fn run_intensity_analysis(
	volume: &Tensor,
	params: &IntensityAnalysisParams,
	stages: &[Stage],
	emitter: &mut ThrottledEmitter,
	cancel: &CancelToken,
	durations: &mut Vec<(String, f64)>,
) -> Result<(AnalysisOutput, f32, Vec<(String, Tensor)>)> {
	let shape = volume.shape();
	for &c in &params.channels {
		if c >= shape.c {
			return Err(Error::shape(format!("channel {c} out of range for {} channels", shape.c)));
		}
	}

	check_cancel(cancel)?;
	let channels: Vec<usize> = params.channels.iter().map(|&c| c as usize).collect();
	let stats = timed("histogram_percentiles", durations, || intensity_analysis(volume, &channels))?;
	emitter.emit("histogram_percentiles", cumulative_weight(stages, 0), true);

	// No ambiguity or non-determinism in a per-channel histogram/percentile
	// computation: confidence is fixed at 1.0 (spec.md §3 requires a
	// finite score in [0,1] for every algorithm; §4.I only defines a
	// heuristic for the other three).
	Ok((AnalysisOutput::IntensityAnalysis(stats), 1.0, Vec::new()))
}

fn run_deconvolution(
	volume: &Tensor,
	metadata: &Metadata,
	params: &DeconvolutionParams,
	stages: &[Stage],
	emitter: &mut ThrottledEmitter,
	cancel: &CancelToken,
	durations: &mut Vec<(String, f64)>,
) -> Result<(AnalysisOutput, f32, Vec<(String, Tensor)>)> {
	let shape = volume.shape();

	check_cancel(cancel)?;
	let psf = timed("psf_preparation", durations, || match params.psf_source {
		PsfSource::Synthetic => {
			let na = params.na.expect("validated by Parameters::validate");
			let wavelength_nm = params.wavelength_nm.expect("validated by Parameters::validate");
			// PsfParams::voxel_size_um is (z, y, x), matching the kernel
			// library's rank-3 axis order.
			let voxel = (
				metadata.voxel_size.z_um.unwrap_or(DEFAULT_VOXEL_SIZE_UM),
				metadata.voxel_size.y_um.unwrap_or(DEFAULT_VOXEL_SIZE_UM),
				metadata.voxel_size.x_um.unwrap_or(DEFAULT_VOXEL_SIZE_UM),
			);
			synthesize_matching_psf(na, wavelength_nm, voxel, (shape.z as usize, shape.y as usize, shape.x as usize))
		}
		PsfSource::User => {
			let user = params.user_psf.as_ref().expect("validated by Parameters::validate");
			deconv::normalize_psf(user)
		}
	})?;
	emitter.emit("psf_preparation", cumulative_weight(stages, 0), true);

	check_cancel(cancel)?;
	let regularization = match params.regularization {
		Regularization::None => deconv::Regularization::None,
		Regularization::Tv => deconv::Regularization::Tv,
	};
	let rl_params = RichardsonLucyParams {
		iterations: params.iterations,
		regularization,
		lambda_tv: params.lambda_tv.unwrap_or(0.01),
		tol: params.tol.unwrap_or(1e-4),
	};
	let output = timed("iterate", durations, || deconv::richardson_lucy(volume, &psf, &rl_params))?;
	emitter.emit("iterate", cumulative_weight(stages, 1), true);

	let confidence_score = (1.0 - output.final_relative_change).clamp(0.0, 1.0);

	let mut derived = Vec::new();
	derived.push(("deconvolved".to_string(), output.volume));

	Ok((AnalysisOutput::Deconvolution { final_relative_change: output.final_relative_change }, confidence_score, derived))
}

fn synthesize_matching_psf(na: f32, wavelength_nm: f32, voxel_size_um: (f64, f64, f64), shape: (usize, usize, usize)) -> Result<Tensor> {
	let psf_shape = (shape.0.min(15) | 1, shape.1.min(15) | 1, shape.2.min(15) | 1);
	let params = PsfParams { na, wavelength_nm, voxel_size_um, shape: psf_shape };
	deconv::synthesize_gaussian_psf(&params)
}

/// Applies a local (halo-bounded) kernel tile-by-tile and stitches the
/// cores back into a full volume (spec.md §4.J's correctness contract:
/// applying the kernel to a halo-padded tile and cropping to the core is
/// identical to whole-volume execution, since the halo equals the
/// kernel's half-width and no core output ever reads past it). Retries a
/// tile at half its core size once on [`Error::AllocError`], per spec.md
/// §7; persistent failure surfaces [`Error::OutOfMemory`].
fn apply_tiled(volume: &Tensor, plan: &TilePlan, kernel: impl Fn(&Tensor) -> Result<Tensor>) -> Result<Tensor> {
	let shape = volume.shape();
	match plan {
		TilePlan::SinglePass => kernel(volume),
		TilePlan::Tiles(tiles) => {
			let (vz, vy, vx) = shape.zyx();
			let mut out_data = vec![0f32; vz as usize * vy as usize * vx as usize];
			for tile in tiles {
				write_tile(volume, tile, &kernel, &mut out_data, (vy as usize, vx as usize))?;
			}
			Tensor::from_host_f32(out_data, Shape4::new(1, vz, vy, vx), volume.location())
		}
	}
}

fn write_tile(volume: &Tensor, tile: &TileView, kernel: &impl Fn(&Tensor) -> Result<Tensor>, out_data: &mut [f32], out_plane: (usize, usize)) -> Result<()> {
	match process_tile(volume, tile, kernel) {
		Ok((data, read_extent)) => {
			copy_core(tile, &data, read_extent, out_data, out_plane);
			Ok(())
		}
		Err(Error::AllocError { detail }) => {
			log::warn!("orchestrator: tile alloc failed ({detail}), retrying at half core size");
			for half in split_tile(tile) {
				match process_tile(volume, &half, kernel) {
					Ok((data, read_extent)) => copy_core(&half, &data, read_extent, out_data, out_plane),
					Err(Error::AllocError { detail }) => return Err(Error::OutOfMemory { detail: format!("tile retry at half size also failed: {detail}") }),
					Err(e) => return Err(e),
				}
			}
			Ok(())
		}
		Err(e) => Err(e),
	}
}

fn process_tile(volume: &Tensor, tile: &TileView, kernel: &impl Fn(&Tensor) -> Result<Tensor>) -> Result<(Vec<f32>, (u32, u32, u32))> {
	let shape = volume.shape();
	let (read_origin, read_extent) = tile.read_region(shape.zyx());
	let sub = volume.view(read_origin, read_extent)?;
	let processed = kernel(&sub)?;
	Ok((processed.to_host_f32(), read_extent))
}

fn copy_core(tile: &TileView, processed: &[f32], read_extent: (u32, u32, u32), out_data: &mut [f32], out_plane: (usize, usize)) {
	let (oy_plane, ox_plane) = out_plane;
	let (oz, oy, ox) = tile.origin;
	let (cz, cy, cx) = tile.core_extent;
	let (_, rey, rex) = read_extent;

	// The core always starts at halo-distance into the read region along
	// every axis that wasn't clipped by the volume boundary; `read_region`
	// clips symmetrically, so recomputing the local offset from `origin`
	// and the (possibly clipped) read start is exact.
	let (hz, hy, hx) = tile.halo;
	let clipped_start = |o: u32, h: u32| o.saturating_sub(h);
	let local = (oz - clipped_start(oz, hz), oy - clipped_start(oy, hy), ox - clipped_start(ox, hx));

	for dz in 0..cz as usize {
		for dy in 0..cy as usize {
			for dx in 0..cx as usize {
				let src = ((local.0 as usize + dz) * rey as usize + (local.1 as usize + dy)) * rex as usize + (local.2 as usize + dx);
				let dst = ((oz as usize + dz) * oy_plane + (oy as usize + dy)) * ox_plane + (ox as usize + dx);
				out_data[dst] = processed[src];
			}
		}
	}
}

/// Splits a tile's core into two along its longest axis, preserving halo,
/// for the single allowed OOM retry (spec.md §7).
fn split_tile(tile: &TileView) -> [TileView; 2] {
	let (cz, cy, cx) = tile.core_extent;
	let (oz, oy, ox) = tile.origin;

	if cz >= cy && cz >= cx && cz > 1 {
		let half = cz / 2;
		[
			TileView { origin: (oz, oy, ox), core_extent: (half, cy, cx), halo: tile.halo },
			TileView { origin: (oz + half, oy, ox), core_extent: (cz - half, cy, cx), halo: tile.halo },
		]
	} else if cy >= cx && cy > 1 {
		let half = cy / 2;
		[
			TileView { origin: (oz, oy, ox), core_extent: (cz, half, cx), halo: tile.halo },
			TileView { origin: (oz, oy + half, ox), core_extent: (cz, cy - half, cx), halo: tile.halo },
		]
	} else {
		let half = (cx / 2).max(1);
		[
			TileView { origin: (oz, oy, ox), core_extent: (cz, cy, half), halo: tile.halo },
			TileView { origin: (oz, oy, ox + half), core_extent: (cz, cy, cx.saturating_sub(half).max(1)), halo: tile.halo },
		]
	}
}
