//! Per-algorithm parameter schema (spec.md §6). Replaces an untyped
//! key/value map with typed variants validated once at request entry;
//! there is no "unknown key" case to reject because the Rust type system
//! already rejects anything outside a variant's fields.

use crate::error::{Error, Result};
use crate::kernel::Connectivity;
use crate::tensor::Tensor;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
	Segmentation3d,
	Colocalization,
	IntensityAnalysis,
	Deconvolution,
}

impl Algorithm {
	pub fn name(self) -> &'static str {
		match self {
			Algorithm::Segmentation3d => "segmentation_3d",
			Algorithm::Colocalization => "colocalization",
			Algorithm::IntensityAnalysis => "intensity_analysis",
			Algorithm::Deconvolution => "deconvolution",
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PsfSource {
	Synthetic,
	User,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Regularization {
	None,
	Tv,
}

#[derive(Clone, Debug)]
pub struct Segmentation3dParams {
	pub sigma: f32,
	pub rolling_ball_radius: u32,
	pub min_object_voxels: u32,
	pub connectivity: Connectivity,
}

impl Default for Segmentation3dParams {
	fn default() -> Self {
		Segmentation3dParams { sigma: 1.0, rolling_ball_radius: 25, min_object_voxels: 64, connectivity: Connectivity::TwentySix }
	}
}

#[derive(Clone, Debug)]
pub struct ColocalizationParams {
	pub channel_a: u32,
	pub channel_b: u32,
	pub threshold_a: Option<f32>,
	pub threshold_b: Option<f32>,
	pub mask_from_labels: bool,
}

#[derive(Clone, Debug)]
pub struct IntensityAnalysisParams {
	pub channels: Vec<u32>,
}

/// `user_psf` is not part of spec.md §6's scalar key/value schema — a PSF
/// volume cannot be expressed as a schema scalar. It travels alongside the
/// validated scalars as an out-of-band tensor, required exactly when
/// `psf_source == User`.
#[derive(Clone, Debug)]
pub struct DeconvolutionParams {
	pub iterations: u32,
	pub psf_source: PsfSource,
	pub na: Option<f32>,
	pub wavelength_nm: Option<f32>,
	pub regularization: Regularization,
	pub lambda_tv: Option<f32>,
	pub tol: Option<f32>,
	pub user_psf: Option<Tensor>,
}

#[derive(Clone, Debug)]
pub enum Parameters {
	Segmentation3d(Segmentation3dParams),
	Colocalization(ColocalizationParams),
	IntensityAnalysis(IntensityAnalysisParams),
	Deconvolution(DeconvolutionParams),
}

impl Parameters {
	pub fn algorithm(&self) -> Algorithm {
		match self {
			Parameters::Segmentation3d(_) => Algorithm::Segmentation3d,
			Parameters::Colocalization(_) => Algorithm::Colocalization,
			Parameters::IntensityAnalysis(_) => Algorithm::IntensityAnalysis,
			Parameters::Deconvolution(_) => Algorithm::Deconvolution,
		}
	}

	/// Validates every field against its per-algorithm schema (spec.md
	/// §6). Called once, at `VALIDATE_PARAMS` in the orchestrator's state
	/// machine, before any tensor work begins.
	pub fn validate(&self) -> Result<()> {
		match self {
			Parameters::Segmentation3d(p) => {
				if !(0.0..=10.0).contains(&p.sigma) {
					return Err(Error::invalid_parameter("sigma", format!("must be in [0, 10], got {}", p.sigma)));
				}
				if p.rolling_ball_radius > 200 {
					return Err(Error::invalid_parameter("rolling_ball_radius", format!("must be in [0, 200], got {}", p.rolling_ball_radius)));
				}
				Ok(())
			}
			Parameters::Colocalization(p) => {
				if p.channel_a == p.channel_b {
					return Err(Error::invalid_parameter("channel_b", "channel_a and channel_b must differ"));
				}
				for (name, value) in [("threshold_a", p.threshold_a), ("threshold_b", p.threshold_b)] {
					if let Some(v) = value {
						if !v.is_finite() {
							return Err(Error::invalid_parameter(name, "must be finite"));
						}
					}
				}
				Ok(())
			}
			Parameters::IntensityAnalysis(p) => {
				if p.channels.is_empty() {
					return Err(Error::invalid_parameter("channels", "must name at least one channel"));
				}
				Ok(())
			}
			Parameters::Deconvolution(p) => {
				if !(1..=500).contains(&p.iterations) {
					return Err(Error::invalid_parameter("iterations", format!("must be in [1, 500], got {}", p.iterations)));
				}
				if p.psf_source == PsfSource::Synthetic {
					if p.na.is_none() || p.wavelength_nm.is_none() {
						return Err(Error::invalid_parameter("na/wavelength_nm", "required when psf_source is synthetic"));
					}
				}
				if p.psf_source == PsfSource::User && p.user_psf.is_none() {
					return Err(Error::invalid_parameter("user_psf", "required when psf_source is user"));
				}
				if let Some(lambda) = p.lambda_tv {
					if !(lambda.is_finite() && lambda >= 0.0) {
						return Err(Error::invalid_parameter("lambda_tv", "must be finite and non-negative"));
					}
				}
				if let Some(tol) = p.tol {
					if !(tol.is_finite() && tol >= 0.0) {
						return Err(Error::invalid_parameter("tol", "must be finite and non-negative"));
					}
				}
				Ok(())
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn segmentation_rejects_out_of_range_sigma() {
		let params = Parameters::Segmentation3d(Segmentation3dParams { sigma: 20.0, ..Default::default() });
		assert!(params.validate().is_err());
	}

	#[test]
	fn colocalization_rejects_identical_channels() {
		let params = Parameters::Colocalization(ColocalizationParams {
			channel_a: 0,
			channel_b: 0,
			threshold_a: None,
			threshold_b: None,
			mask_from_labels: false,
		});
		assert!(params.validate().is_err());
	}

	#[test]
	fn deconvolution_requires_na_and_wavelength_for_synthetic_psf() {
		let params = Parameters::Deconvolution(DeconvolutionParams {
			iterations: 10,
			psf_source: PsfSource::Synthetic,
			na: None,
			wavelength_nm: Some(525.0),
			regularization: Regularization::None,
			lambda_tv: None,
			tol: None,
			user_psf: None,
		});
		assert!(params.validate().is_err());
	}

	#[test]
	fn deconvolution_accepts_user_psf_without_na() {
		let shape = crate::tensor::Shape4::new(1, 1, 1, 1);
		let psf = Tensor::from_host_f32(vec![1.0], shape, crate::tensor::Location::Host).unwrap();
		let params = Parameters::Deconvolution(DeconvolutionParams {
			iterations: 10,
			psf_source: PsfSource::User,
			na: None,
			wavelength_nm: None,
			regularization: Regularization::None,
			lambda_tv: None,
			tol: None,
			user_psf: Some(psf),
		});
		assert!(params.validate().is_ok());
	}
}
