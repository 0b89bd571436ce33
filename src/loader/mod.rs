//! Streaming image loader (spec component G): format-agnostic decoder for
//! multi-dimensional microscopy containers. Dispatches on extension, then
//! verifies by magic bytes; exposes either a fully materialized [`Tensor`]
//! or a lazy [`ChunkedView`] for oversized files, plus a normalized
//! [`Metadata`] record.

mod czi;
mod lif;
mod nd2;
mod tiff;

use std::path::Path;

use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::tensor::{DType, Tensor};

const LAZY_THRESHOLD_BYTES: u64 = 1024 * 1024 * 1024; // 1 GiB

/// Which position/timepoint to read, and whether to force (or forbid)
/// lazy mode.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReadRequest {
	pub position: u32,
	pub timepoint: u32,
	pub force_lazy: Option<bool>,
}

/// The native (or default) chunk shape a format exposes for lazy reads, in
/// (Z, Y, X) voxels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkShape {
	pub z: u32,
	pub y: u32,
	pub x: u32,
}

impl Default for ChunkShape {
	fn default() -> Self {
		ChunkShape { z: 64, y: 512, x: 512 }
	}
}

/// Deterministic sequential iteration over a volume too large to
/// materialize at once. Owns a descriptor (chunk shape, origin grid) and a
/// materialization function; no on-demand DAG recomputation.
pub struct ChunkedView {
	chunk_shape: ChunkShape,
	volume_shape: (u32, u32, u32, u32), // (c, z, y, x)
	next_origin: Option<(u32, u32, u32)>,
	materialize: Box<dyn FnMut((u32, u32, u32), (u32, u32, u32)) -> Result<Tensor> + Send>,
}

impl ChunkedView {
	pub fn new(
		chunk_shape: ChunkShape,
		volume_shape: (u32, u32, u32, u32),
		materialize: Box<dyn FnMut((u32, u32, u32), (u32, u32, u32)) -> Result<Tensor> + Send>,
	) -> Self {
		ChunkedView { chunk_shape, volume_shape, next_origin: Some((0, 0, 0)), materialize }
	}

	pub fn chunk_shape(&self) -> ChunkShape {
		self.chunk_shape
	}
}

impl Iterator for ChunkedView {
	type Item = Result<Tensor>;

	fn next(&mut self) -> Option<Self::Item> {
		let (z0, y0, x0) = self.next_origin?;
		let (_c, z, y, x) = self.volume_shape;

		let dz = self.chunk_shape.z.min(z - z0);
		let dy = self.chunk_shape.y.min(y - y0);
		let dx = self.chunk_shape.x.min(x - x0);

		let result = (self.materialize)((z0, y0, x0), (dz, dy, dx));

		// Advance in (z, y, x) raster order over the chunk grid.
		let mut nx = x0 + dx;
		let mut ny = y0;
		let mut nz = z0;
		if nx >= x {
			nx = 0;
			ny += dy;
			if ny >= y {
				ny = 0;
				nz += dz;
			}
		}
		self.next_origin = if nz >= z { None } else { Some((nz, ny, nx)) };

		Some(result)
	}
}

pub enum VolumeOrChunked {
	Volume(Tensor),
	Chunked(ChunkedView),
}

/// Implemented once per container format. Mirrors the engine's
/// per-backend device trait split: one file per format, one shared trait.
trait FormatReader {
	/// Extensions this reader claims, lowercase, without the leading dot.
	fn extensions() -> &'static [&'static str];
	/// First bytes of the file that identify it; `probe`/`read` verify
	/// these before trusting the extension-based dispatch.
	fn magic_matches(bytes: &[u8]) -> bool;

	fn probe(path: &Path) -> Result<Metadata>;
	/// `lazy` is decided by [`read`] from the probed metadata and memory
	/// budget before dispatch, so every reader honors it rather than
	/// guessing independently.
	fn read(path: &Path, request: ReadRequest, lazy: bool) -> Result<(VolumeOrChunked, Metadata)>;
}

fn extension_chain(path: &Path) -> Vec<String> {
	let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_ascii_lowercase();
	let parts: Vec<&str> = name.split('.').collect();
	if parts.len() < 2 {
		return Vec::new();
	}
	// Support compound extensions like `ome.tif` in addition to the final
	// `tif`/`tiff` suffix.
	let mut chains = Vec::new();
	for i in 1..parts.len() {
		chains.push(parts[i..].join("."));
	}
	chains
}

fn read_magic(path: &Path) -> Result<Vec<u8>> {
	use std::io::Read;
	let mut file = std::fs::File::open(path).map_err(|e| Error::MalformedFile {
		path: path.display().to_string(),
		detail: e.to_string(),
	})?;
	let mut buf = vec![0u8; 64];
	let n = file.read(&mut buf).map_err(|e| Error::MalformedFile {
		path: path.display().to_string(),
		detail: e.to_string(),
	})?;
	buf.truncate(n);
	Ok(buf)
}

macro_rules! dispatch_formats {
	($path:expr, $ext_chain:expr, $magic:expr, $op:ident $(, $arg:expr)*) => {{
		if tiff::TiffReader::extensions().iter().any(|e| $ext_chain.iter().any(|c| c == e)) && tiff::TiffReader::magic_matches(&$magic) {
			tiff::TiffReader::$op($path $(, $arg)*)
		} else if czi::CziReader::extensions().iter().any(|e| $ext_chain.iter().any(|c| c == e)) && czi::CziReader::magic_matches(&$magic) {
			czi::CziReader::$op($path $(, $arg)*)
		} else if nd2::Nd2Reader::extensions().iter().any(|e| $ext_chain.iter().any(|c| c == e)) && nd2::Nd2Reader::magic_matches(&$magic) {
			nd2::Nd2Reader::$op($path $(, $arg)*)
		} else if lif::LifReader::extensions().iter().any(|e| $ext_chain.iter().any(|c| c == e)) && lif::LifReader::magic_matches(&$magic) {
			lif::LifReader::$op($path $(, $arg)*)
		} else {
			Err(Error::UnsupportedFormat { detail: format!("{:?} does not match a known format's extension+magic", $path) })
		}
	}};
}

/// Reads metadata only, without touching pixel data.
pub fn probe(path: impl AsRef<Path>) -> Result<Metadata> {
	let path = path.as_ref();
	let ext_chain = extension_chain(path);
	let magic = read_magic(path)?;
	dispatch_formats!(path, ext_chain, magic, probe)
}

/// Reads the requested position/timepoint. Lazy mode is selected
/// automatically when the estimated in-memory size exceeds 1 GiB or half
/// the device memory budget, unless `request.force_lazy` overrides it. The
/// decision is made once, from a metadata probe, before dispatch — readers
/// are handed the already-decided `lazy` flag rather than each re-deriving
/// it (and risking disagreement with the budget check here).
pub fn read(path: impl AsRef<Path>, request: ReadRequest, memory_budget_bytes: u64) -> Result<(VolumeOrChunked, Metadata)> {
	let path = path.as_ref();
	let ext_chain = extension_chain(path);
	let magic = read_magic(path)?;

	let probed: Metadata = dispatch_formats!(path, ext_chain, magic, probe)?;
	let lazy = match request.force_lazy {
		Some(force) => force,
		None => estimate_bytes(&probed).map_or(false, |bytes| bytes > LAZY_THRESHOLD_BYTES || bytes > memory_budget_bytes / 2),
	};

	dispatch_formats!(path, ext_chain, magic, read, request, lazy)
}

fn estimate_bytes(metadata: &Metadata) -> Option<u64> {
	let dims = metadata.dimensions?;
	let bytes_per_sample = (metadata.bits_per_sample.unwrap_or(16) as u64 + 7) / 8;
	Some(dims.sx as u64 * dims.sy as u64 * dims.sz as u64 * dims.sc as u64 * bytes_per_sample)
}

pub(crate) fn dtype_for_bits(bits: u16) -> Result<DType> {
	match bits {
		8 => Ok(DType::U8),
		16 => Ok(DType::U16),
		32 => Ok(DType::F32),
		other => Err(Error::UnsupportedFormat { detail: format!("unsupported bit depth {other}") }),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn extension_chain_supports_compound_suffixes() {
		let chain = extension_chain(Path::new("volume.ome.tiff"));
		assert!(chain.contains(&"tiff".to_string()));
		assert!(chain.contains(&"ome.tiff".to_string()));
	}

	#[test]
	fn chunked_view_iterates_whole_volume_without_overlap() {
		let volume_shape = (1u32, 4, 4, 4);
		let view = ChunkedView::new(
			ChunkShape { z: 2, y: 2, x: 2 },
			volume_shape,
			Box::new(|origin, extent| {
				let n = extent.0 as usize * extent.1 as usize * extent.2 as usize;
				Tensor::from_host_f32(vec![0.0; n], crate::tensor::Shape4::new(1, extent.0, extent.1, extent.2), crate::tensor::Location::Host)
					.map_err(|e| e)
					.map(|t| {
						let _ = origin;
						t
					})
			}),
		);
		let chunks: Vec<_> = view.collect();
		assert_eq!(chunks.len(), 8); // 4/2 per axis = 2^3
		assert!(chunks.iter().all(|c| c.is_ok()));
	}
}
