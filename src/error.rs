use std::fmt;

/// Top-level error type returned by every fallible operation in this crate.
///
/// Input errors (`UnsupportedFormat`, `MalformedFile`, `OutOfRange`,
/// `InvalidParameter`) are never retried. Resource errors (`AllocError`,
/// `OutOfMemory`, `InfeasibleBudget`) may trigger a single tile-size retry in
/// the orchestrator before surfacing. `Internal` indicates a logic bug
/// (shape/dtype invariant violated somewhere it should have been caught
/// earlier) rather than anything the caller can act on.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("unsupported file format: {detail}")]
	UnsupportedFormat { detail: String },

	#[error("malformed file {path}: {detail}")]
	MalformedFile { path: String, detail: String },

	#[error("missing optional dependency for reading this format: {dependency}")]
	MissingDependency { dependency: String },

	#[error("{what} out of range: requested {requested}, available {available}")]
	OutOfRange { what: String, requested: String, available: String },

	#[error("shape error: {detail}")]
	ShapeError { detail: String },

	#[error("allocation failed: {detail}")]
	AllocError { detail: String },

	#[error("out of memory: {detail}")]
	OutOfMemory { detail: String },

	#[error("no tiling plan fits the memory budget: {detail}")]
	InfeasibleBudget { detail: String },

	#[error("invalid parameter `{name}`: {reason}")]
	InvalidParameter { name: String, reason: String },

	#[error("request cancelled")]
	Cancelled,

	#[error("device error ({backend}): {detail}")]
	DeviceError { backend: String, detail: String },

	#[error("internal error: {0}")]
	Internal(String),
}

impl Error {
	pub fn internal(detail: impl fmt::Display) -> Self {
		Error::Internal(detail.to_string())
	}

	pub fn shape(detail: impl fmt::Display) -> Self {
		Error::ShapeError { detail: detail.to_string() }
	}

	pub fn invalid_parameter(name: impl Into<String>, reason: impl fmt::Display) -> Self {
		Error::InvalidParameter { name: name.into(), reason: reason.to_string() }
	}
}

pub type Result<T> = std::result::Result<T, Error>;
