//! Baseline TIFF reader covering the subset microscopy exports actually
//! use: classic (32-bit offset) TIFF with uncompressed strips, OME-XML or
//! ImageJ-hyperstack metadata in the `ImageDescription` tag, one plane per
//! IFD. Tiled TIFFs, compression other than "none", and BigTIFF's 64-bit
//! offset layout are out of scope for this reader and surface as
//! `UnsupportedFormat` rather than being silently mishandled or misread.
//!
//! Plane order across IFDs follows OME's default `XYCZT` dimension order:
//! channel varies fastest, then Z, then T — `index = (t * sz + z) * sc + c`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::{dtype_for_bits, ChunkShape, ChunkedView, FormatReader, ReadRequest, VolumeOrChunked};
use crate::error::{Error, Result};
use crate::metadata::{parse_ome_xml, Dimensions, Metadata, PhysicalVoxelSize};
use crate::tensor::{DType, Location, Shape4, Tensor};

pub struct TiffReader;

#[derive(Clone, Copy)]
enum Endian {
	Little,
	Big,
}

impl Endian {
	fn u16(self, b: &[u8]) -> u16 {
		match self {
			Endian::Little => LittleEndian::read_u16(b),
			Endian::Big => BigEndian::read_u16(b),
		}
	}
	fn u32(self, b: &[u8]) -> u32 {
		match self {
			Endian::Little => LittleEndian::read_u32(b),
			Endian::Big => BigEndian::read_u32(b),
		}
	}
}

const TAG_IMAGE_WIDTH: u16 = 256;
const TAG_IMAGE_LENGTH: u16 = 257;
const TAG_BITS_PER_SAMPLE: u16 = 258;
const TAG_COMPRESSION: u16 = 259;
const TAG_IMAGE_DESCRIPTION: u16 = 270;
const TAG_STRIP_OFFSETS: u16 = 273;
const TAG_SAMPLES_PER_PIXEL: u16 = 277;
const TAG_ROWS_PER_STRIP: u16 = 278;
const TAG_STRIP_BYTE_COUNTS: u16 = 279;
const TAG_X_RESOLUTION: u16 = 282;
const TAG_Y_RESOLUTION: u16 = 283;
const TAG_RESOLUTION_UNIT: u16 = 296;
const TAG_SAMPLE_FORMAT: u16 = 339;
const TAG_TILE_WIDTH: u16 = 322;

const TYPE_ASCII: u16 = 2;
const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;
const TYPE_RATIONAL: u16 = 5;

struct RawEntry {
	tag: u16,
	ty: u16,
	count: u32,
	raw: [u8; 4],
}

struct ParsedIfd {
	width: u32,
	height: u32,
	bits_per_sample: u16,
	sample_format: u16,
	samples_per_pixel: u16,
	compression: u16,
	tiled: bool,
	rows_per_strip: u32,
	strip_offsets: Vec<u64>,
	strip_byte_counts: Vec<u64>,
	image_description: Option<String>,
	x_resolution: Option<(u32, u32)>,
	y_resolution: Option<(u32, u32)>,
	resolution_unit: u16,
}

fn io_err(path: &Path, e: std::io::Error) -> Error {
	Error::MalformedFile { path: path.display().to_string(), detail: e.to_string() }
}

fn read_header(file: &mut File, path: &Path) -> Result<(Endian, u64)> {
	let mut header = [0u8; 8];
	file.seek(SeekFrom::Start(0)).map_err(|e| io_err(path, e))?;
	file.read_exact(&mut header).map_err(|e| io_err(path, e))?;

	let endian = match &header[0..2] {
		b"II" => Endian::Little,
		b"MM" => Endian::Big,
		_ => return Err(Error::UnsupportedFormat { detail: format!("{:?} is not a TIFF byte-order marker", &header[0..2]) }),
	};

	let magic = endian.u16(&header[2..4]);
	if magic == 43 {
		return Err(Error::UnsupportedFormat { detail: "BigTIFF (64-bit offsets) is not supported by this reader".to_string() });
	}
	if magic != 42 {
		return Err(Error::MalformedFile { path: path.display().to_string(), detail: format!("unexpected TIFF magic {magic}") });
	}
	let first_ifd = endian.u32(&header[4..8]) as u64;
	Ok((endian, first_ifd))
}

fn read_at(file: &mut File, path: &Path, offset: u64, buf: &mut [u8]) -> Result<()> {
	file.seek(SeekFrom::Start(offset)).map_err(|e| io_err(path, e))?;
	file.read_exact(buf).map_err(|e| io_err(path, e))?;
	Ok(())
}

fn type_size(ty: u16) -> usize {
	match ty {
		TYPE_ASCII | 1 /* BYTE */ => 1,
		TYPE_SHORT => 2,
		TYPE_LONG | TYPE_RATIONAL => 4, // RATIONAL's *component* size; total is 8
		_ => 4,
	}
}

/// Reads one IFD's raw 12-byte entries plus the offset to the next IFD.
/// Tag *values* are resolved lazily by the caller since some live out-of-line.
fn read_ifd_entries(file: &mut File, path: &Path, endian: Endian, offset: u64) -> Result<(Vec<RawEntry>, u64)> {
	let mut count_buf = [0u8; 2];
	read_at(file, path, offset, &mut count_buf)?;
	let count = endian.u16(&count_buf) as usize;

	let mut entries = Vec::with_capacity(count);
	let mut buf = vec![0u8; count * 12];
	read_at(file, path, offset + 2, &mut buf)?;

	for i in 0..count {
		let e = &buf[i * 12..i * 12 + 12];
		let tag = endian.u16(&e[0..2]);
		let ty = endian.u16(&e[2..4]);
		let cnt = endian.u32(&e[4..8]);
		let mut raw = [0u8; 4];
		raw.copy_from_slice(&e[8..12]);
		entries.push(RawEntry { tag, ty, count: cnt, raw });
	}

	let mut next_buf = [0u8; 4];
	read_at(file, path, offset + 2 + (count * 12) as u64, &mut next_buf)?;
	let next = endian.u32(&next_buf) as u64;

	Ok((entries, next))
}

fn find<'a>(entries: &'a [RawEntry], tag: u16) -> Option<&'a RawEntry> {
	entries.iter().find(|e| e.tag == tag)
}

fn scalar_u32(file: &mut File, path: &Path, endian: Endian, entry: &RawEntry) -> Result<u32> {
	match entry.ty {
		TYPE_SHORT => {
			if entry.count <= 1 {
				Ok(endian.u16(&entry.raw[0..2]) as u32)
			} else {
				let offset = endian.u32(&entry.raw) as u64;
				let mut buf = [0u8; 2];
				read_at(file, path, offset, &mut buf)?;
				Ok(endian.u16(&buf) as u32)
			}
		}
		TYPE_LONG => {
			if entry.count <= 1 {
				Ok(endian.u32(&entry.raw))
			} else {
				let offset = endian.u32(&entry.raw) as u64;
				let mut buf = [0u8; 4];
				read_at(file, path, offset, &mut buf)?;
				Ok(endian.u32(&buf))
			}
		}
		other => Err(Error::internal(format!("expected SHORT/LONG tag, found type {other}"))),
	}
}

fn array_u32(file: &mut File, path: &Path, endian: Endian, entry: &RawEntry) -> Result<Vec<u32>> {
	let elem_size = type_size(entry.ty);
	let total_bytes = elem_size * entry.count as usize;

	let bytes = if total_bytes <= 4 {
		entry.raw[0..total_bytes].to_vec()
	} else {
		let offset = endian.u32(&entry.raw) as u64;
		let mut buf = vec![0u8; total_bytes];
		read_at(file, path, offset, &mut buf)?;
		buf
	};

	let mut out = Vec::with_capacity(entry.count as usize);
	for chunk in bytes.chunks(elem_size) {
		out.push(match entry.ty {
			TYPE_SHORT => endian.u16(chunk) as u32,
			TYPE_LONG => endian.u32(chunk),
			other => return Err(Error::internal(format!("expected SHORT/LONG array, found type {other}"))),
		});
	}
	Ok(out)
}

fn ascii(file: &mut File, path: &Path, endian: Endian, entry: &RawEntry) -> Result<String> {
	let len = entry.count as usize;
	let bytes = if len <= 4 {
		entry.raw[0..len.min(4)].to_vec()
	} else {
		let offset = endian.u32(&entry.raw) as u64;
		let mut buf = vec![0u8; len];
		read_at(file, path, offset, &mut buf)?;
		buf
	};
	let s = String::from_utf8_lossy(&bytes);
	Ok(s.trim_end_matches('\0').to_string())
}

fn rational(file: &mut File, path: &Path, endian: Endian, entry: &RawEntry) -> Result<(u32, u32)> {
	let offset = endian.u32(&entry.raw) as u64;
	let mut buf = [0u8; 8];
	read_at(file, path, offset, &mut buf)?;
	Ok((endian.u32(&buf[0..4]), endian.u32(&buf[4..8])))
}

fn parse_ifd(file: &mut File, path: &Path, endian: Endian, offset: u64) -> Result<(ParsedIfd, u64)> {
	let (entries, next) = read_ifd_entries(file, path, endian, offset)?;

	let get_u32 = |file: &mut File, tag: u16| -> Result<u32> {
		let e = find(&entries, tag).ok_or_else(|| Error::MalformedFile { path: path.display().to_string(), detail: format!("missing required TIFF tag {tag}") })?;
		scalar_u32(file, path, endian, e)
	};

	let width = get_u32(file, TAG_IMAGE_WIDTH)?;
	let height = get_u32(file, TAG_IMAGE_LENGTH)?;
	let bits_per_sample = find(&entries, TAG_BITS_PER_SAMPLE).map(|e| scalar_u32(file, path, endian, e)).transpose()?.unwrap_or(8) as u16;
	let samples_per_pixel = find(&entries, TAG_SAMPLES_PER_PIXEL).map(|e| scalar_u32(file, path, endian, e)).transpose()?.unwrap_or(1) as u16;
	let compression = find(&entries, TAG_COMPRESSION).map(|e| scalar_u32(file, path, endian, e)).transpose()?.unwrap_or(1) as u16;
	let sample_format = find(&entries, TAG_SAMPLE_FORMAT).map(|e| scalar_u32(file, path, endian, e)).transpose()?.unwrap_or(1) as u16;
	let rows_per_strip = find(&entries, TAG_ROWS_PER_STRIP).map(|e| scalar_u32(file, path, endian, e)).transpose()?.unwrap_or(height);
	let tiled = find(&entries, TAG_TILE_WIDTH).is_some();
	let resolution_unit = find(&entries, TAG_RESOLUTION_UNIT).map(|e| scalar_u32(file, path, endian, e)).transpose()?.unwrap_or(2) as u16;

	let strip_offsets = match find(&entries, TAG_STRIP_OFFSETS) {
		Some(e) => array_u32(file, path, endian, e)?.into_iter().map(u64::from).collect(),
		None => Vec::new(),
	};
	let strip_byte_counts = match find(&entries, TAG_STRIP_BYTE_COUNTS) {
		Some(e) => array_u32(file, path, endian, e)?.into_iter().map(u64::from).collect(),
		None => Vec::new(),
	};

	let image_description = find(&entries, TAG_IMAGE_DESCRIPTION).map(|e| ascii(file, path, endian, e)).transpose()?;
	let x_resolution = find(&entries, TAG_X_RESOLUTION).map(|e| rational(file, path, endian, e)).transpose()?;
	let y_resolution = find(&entries, TAG_Y_RESOLUTION).map(|e| rational(file, path, endian, e)).transpose()?;

	Ok((
		ParsedIfd {
			width,
			height,
			bits_per_sample,
			sample_format,
			samples_per_pixel,
			compression,
			tiled,
			rows_per_strip,
			strip_offsets,
			strip_byte_counts,
			image_description,
			x_resolution,
			y_resolution,
			resolution_unit,
		},
		next,
	))
}

fn walk_ifd_chain(file: &mut File, path: &Path, endian: Endian, first_ifd: u64) -> Result<Vec<ParsedIfd>> {
	let mut ifds = Vec::new();
	let mut offset = first_ifd;
	while offset != 0 {
		let (ifd, next) = parse_ifd(file, path, endian, offset)?;
		ifds.push(ifd);
		offset = next;
		if ifds.len() > 1_000_000 {
			return Err(Error::MalformedFile { path: path.display().to_string(), detail: "IFD chain exceeds sanity limit".into() });
		}
	}
	if ifds.is_empty() {
		return Err(Error::MalformedFile { path: path.display().to_string(), detail: "no IFDs found".into() });
	}
	Ok(ifds)
}

/// ImageJ hyperstacks pack their dimension layout into a `key=value\n`
/// blob in `ImageDescription` rather than OME-XML.
fn parse_imagej_description(description: &str) -> (Option<u32>, Option<u32>, Option<u32>, Option<f64>) {
	let mut channels = None;
	let mut slices = None;
	let mut frames = None;
	let mut spacing = None;
	for line in description.lines() {
		if let Some((k, v)) = line.split_once('=') {
			match k {
				"channels" => channels = v.parse().ok(),
				"slices" => slices = v.parse().ok(),
				"frames" => frames = v.parse().ok(),
				"spacing" => spacing = v.parse().ok(),
				_ => {}
			}
		}
	}
	(channels, slices, frames, spacing)
}

fn resolution_to_um_per_pixel(resolution: Option<(u32, u32)>, unit: u16) -> Option<f64> {
	let (num, den) = resolution?;
	if num == 0 {
		return None;
	}
	let pixels_per_unit = num as f64 / den as f64;
	let um_per_pixel = match unit {
		3 => 10_000.0 / pixels_per_unit, // centimeter
		_ => 25_400.0 / pixels_per_unit, // inch (unit == 2), or unspecified
	};
	Some(um_per_pixel)
}

/// Derives the normalized [`Metadata`] plus the dense plane count actually
/// present in the file (`sc * sz * st`, validated against `ifds.len()`).
fn derive_metadata(ifds: &[ParsedIfd], path: &Path) -> Result<Metadata> {
	let first = &ifds[0];

	if first.tiled {
		return Err(Error::UnsupportedFormat { detail: "tiled TIFF (non-strip) layout is not supported".into() });
	}
	if first.compression != 1 {
		return Err(Error::UnsupportedFormat { detail: format!("TIFF compression scheme {} is not supported, only uncompressed", first.compression) });
	}

	let mut metadata = Metadata::default();
	metadata.bits_per_sample = Some(first.bits_per_sample);

	let mut sc = 1u32;
	let mut sz = ifds.len() as u32;
	let mut st = 1u32;

	if let Some(description) = &first.image_description {
		if description.contains("<OME") {
			let ome = parse_ome_xml(description);
			if ome.dimensions.is_some() {
				metadata = ome;
			}
		} else if description.contains("ImageJ=") {
			let (channels, slices, frames, spacing) = parse_imagej_description(description);
			sc = channels.unwrap_or(1);
			sz = slices.unwrap_or(ifds.len() as u32 / sc.max(1));
			st = frames.unwrap_or(1);
			metadata.voxel_size.z_um = spacing;
		}
	}

	if metadata.dimensions.is_none() {
		if sc.saturating_mul(sz).saturating_mul(st) != ifds.len() as u32 {
			// Fall back to "every IFD is an independent Z slice of a
			// single channel/timepoint" when the declared layout and the
			// actual page count disagree.
			sc = 1;
			st = 1;
			sz = ifds.len() as u32;
		}
		metadata.dimensions = Some(Dimensions { sx: first.width, sy: first.height, sz, sc, st });
	}

	if metadata.voxel_size.x_um.is_none() {
		metadata.voxel_size.x_um = resolution_to_um_per_pixel(first.x_resolution, first.resolution_unit);
	}
	if metadata.voxel_size.y_um.is_none() {
		metadata.voxel_size.y_um = resolution_to_um_per_pixel(first.y_resolution, first.resolution_unit);
	}
	metadata.voxel_size = PhysicalVoxelSize {
		x_um: metadata.voxel_size.x_um,
		y_um: metadata.voxel_size.y_um,
		z_um: metadata.voxel_size.z_um,
	};

	metadata.validate().map_err(|e| Error::MalformedFile { path: path.display().to_string(), detail: e.to_string() })?;
	Ok(metadata)
}

fn plane_index(dims: Dimensions, t: u32, z: u32, c: u32) -> usize {
	((t * dims.sz + z) * dims.sc + c) as usize
}

enum PlaneBuffer {
	U8(Vec<u8>),
	U16(Vec<u16>),
	F32(Vec<f32>),
}

fn read_plane(file: &mut File, path: &Path, endian: Endian, ifd: &ParsedIfd, dtype: DType) -> Result<PlaneBuffer> {
	let mut raw = Vec::with_capacity(ifd.strip_byte_counts.iter().sum::<u64>() as usize);
	for (&offset, &len) in ifd.strip_offsets.iter().zip(ifd.strip_byte_counts.iter()) {
		let mut buf = vec![0u8; len as usize];
		read_at(file, path, offset, &mut buf)?;
		raw.extend_from_slice(&buf);
	}

	let expected = ifd.width as usize * ifd.height as usize * dtype.size_bytes();
	if raw.len() < expected {
		return Err(Error::MalformedFile { path: path.display().to_string(), detail: format!("plane has {} bytes, expected {expected}", raw.len()) });
	}

	Ok(match dtype {
		DType::U8 => PlaneBuffer::U8(raw[..expected].to_vec()),
		DType::U16 => {
			let mut v = vec![0u16; ifd.width as usize * ifd.height as usize];
			for (i, chunk) in raw[..expected].chunks(2).enumerate() {
				v[i] = endian.u16(chunk);
			}
			PlaneBuffer::U16(v)
		}
		DType::F32 => {
			let mut v = vec![0f32; ifd.width as usize * ifd.height as usize];
			for (i, chunk) in raw[..expected].chunks(4).enumerate() {
				let bits = endian.u32(chunk);
				v[i] = f32::from_bits(bits);
			}
			PlaneBuffer::F32(v)
		}
	})
}

fn dtype_of(ifd: &ParsedIfd, path: &Path) -> Result<DType> {
	if ifd.bits_per_sample == 32 && ifd.sample_format != 3 {
		return Err(Error::UnsupportedFormat { detail: "32-bit integer TIFF samples are not supported, only 32-bit float".into() });
	}
	if ifd.samples_per_pixel != 1 {
		return Err(Error::UnsupportedFormat { detail: format!("{} interleaved samples per pixel is not supported, only single-channel planes", ifd.samples_per_pixel) });
	}
	let path = path.to_path_buf();
	dtype_for_bits(ifd.bits_per_sample).map_err(|_| Error::UnsupportedFormat { detail: format!("unsupported TIFF bit depth {} at {:?}", ifd.bits_per_sample, path) })
}

fn crop_plane(buffer: PlaneBuffer, width: u32, y0: u32, x0: u32, dy: u32, dx: u32) -> (Vec<f32>, DType) {
	let w = width as usize;
	let mut out = vec![0f32; dy as usize * dx as usize];
	let get = |i: usize| -> f32 {
		match &buffer {
			PlaneBuffer::U8(v) => v[i] as f32,
			PlaneBuffer::U16(v) => v[i] as f32,
			PlaneBuffer::F32(v) => v[i],
		}
	};
	for yy in 0..dy as usize {
		for xx in 0..dx as usize {
			let src = (y0 as usize + yy) * w + (x0 as usize + xx);
			out[yy * dx as usize + xx] = get(src);
		}
	}
	let dtype = match buffer {
		PlaneBuffer::U8(_) => DType::U8,
		PlaneBuffer::U16(_) => DType::U16,
		PlaneBuffer::F32(_) => DType::F32,
	};
	(out, dtype)
}

impl FormatReader for TiffReader {
	fn extensions() -> &'static [&'static str] {
		// `lsm` (Zeiss's format) is itself a TIFF container with private
		// tags this reader ignores; baseline strips decode the same way,
		// per spec.md §6's accepted-extension list.
		&["tif", "tiff", "ome.tif", "ome.tiff", "lsm"]
	}

	fn magic_matches(bytes: &[u8]) -> bool {
		bytes.len() >= 4 && (&bytes[0..2] == b"II" || &bytes[0..2] == b"MM") && {
			let endian = if &bytes[0..2] == b"II" { Endian::Little } else { Endian::Big };
			let magic = endian.u16(&bytes[2..4]);
			magic == 42 || magic == 43
		}
	}

	fn probe(path: &Path) -> Result<Metadata> {
		let mut file = File::open(path).map_err(|e| io_err(path, e))?;
		let (endian, first_ifd) = read_header(&mut file, path)?;
		let ifds = walk_ifd_chain(&mut file, path, endian, first_ifd)?;
		derive_metadata(&ifds, path)
	}

	fn read(path: &Path, request: ReadRequest, lazy: bool) -> Result<(VolumeOrChunked, Metadata)> {
		if request.position != 0 {
			return Err(Error::OutOfRange { what: "position".into(), requested: request.position.to_string(), available: "0".into() });
		}

		let mut file = File::open(path).map_err(|e| io_err(path, e))?;
		let (endian, first_ifd) = read_header(&mut file, path)?;
		let ifds = walk_ifd_chain(&mut file, path, endian, first_ifd)?;
		let metadata = derive_metadata(&ifds, path)?;
		let dims = metadata.dimensions.ok_or_else(|| Error::internal("TIFF metadata missing dimensions after derivation"))?;

		if request.timepoint >= dims.st {
			return Err(Error::OutOfRange { what: "timepoint".into(), requested: request.timepoint.to_string(), available: dims.st.to_string() });
		}

		let dtype = dtype_of(&ifds[0], path)?;
		let path_owned = path.to_path_buf();

		if !lazy {
			let (c, z, y, x) = (dims.sc, dims.sz, dims.sy, dims.sx);
			let mut out = vec![0f32; c as usize * z as usize * y as usize * x as usize];
			let plane_len = y as usize * x as usize;
			for ci in 0..c {
				for zi in 0..z {
					let ifd = &ifds[plane_index(dims, request.timepoint, zi, ci)];
					let plane = read_plane(&mut file, path, endian, ifd, dtype)?;
					let (cropped, _) = crop_plane(plane, x, 0, 0, y, x);
					let dst_start = (ci as usize * z as usize + zi as usize) * plane_len;
					out[dst_start..dst_start + plane_len].copy_from_slice(&cropped);
				}
			}
			let tensor = Tensor::from_host_f32(out, Shape4::new(c, z, y, x), Location::Host)?.astype(dtype);
			return Ok((VolumeOrChunked::Volume(tensor), metadata));
		}

		let chunk_shape = ChunkShape::default();
		let volume_shape = (dims.sc, dims.sz, dims.sy, dims.sx);
		let timepoint = request.timepoint;

		let view = ChunkedView::new(
			chunk_shape,
			volume_shape,
			Box::new(move |origin, extent| {
				let mut file = File::open(&path_owned).map_err(|e| io_err(&path_owned, e))?;
				let (z0, y0, x0) = origin;
				let (dz, dy, dx) = extent;
				let mut out = vec![0f32; dims.sc as usize * dz as usize * dy as usize * dx as usize];
				let plane_len = dy as usize * dx as usize;

				for ci in 0..dims.sc {
					for zrel in 0..dz {
						let zi = z0 + zrel;
						let ifd = &ifds[plane_index(dims, timepoint, zi, ci)];
						let plane = read_plane(&mut file, &path_owned, endian, ifd, dtype)?;
						let (cropped, _) = crop_plane(plane, ifd.width, y0, x0, dy, dx);
						let dst_start = (ci as usize * dz as usize + zrel as usize) * plane_len;
						out[dst_start..dst_start + plane_len].copy_from_slice(&cropped);
					}
				}
				Tensor::from_host_f32(out, Shape4::new(dims.sc, dz, dy, dx), Location::Host).map(|t| t.astype(dtype))
			}),
		);

		Ok((VolumeOrChunked::Chunked(view), metadata))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use byteorder::WriteBytesExt;
	use std::io::Write;

	/// Minimal little-endian, single-strip, uncompressed OME-TIFF writer
	/// used only to exercise the reader above in tests. Writes one IFD per
	/// (t, z, c) plane in the XYCZT order the reader assumes.
	fn write_test_ome_tiff(path: &Path, dims: Dimensions, voxel_um: (f64, f64, f64), planes: &[Vec<u16>]) {
		let mut buf: Vec<u8> = Vec::new();
		buf.extend_from_slice(b"II");
		buf.write_u16::<LittleEndian>(42).unwrap();
		buf.write_u32::<LittleEndian>(8).unwrap(); // first IFD right after the header

		let ome_xml = format!(
			concat!(
				"<OME><Image><Pixels SizeX=\"{}\" SizeY=\"{}\" SizeZ=\"{}\" SizeC=\"{}\" SizeT=\"{}\" ",
				"PhysicalSizeX=\"{}\" PhysicalSizeY=\"{}\" PhysicalSizeZ=\"{}\" SignificantBits=\"16\" /></Image></OME>"
			),
			dims.sx, dims.sy, dims.sz, dims.sc, dims.st, voxel_um.0, voxel_um.1, voxel_um.2
		);
		let mut description = ome_xml.into_bytes();
		description.push(0);

		let plane_bytes = dims.sx as usize * dims.sy as usize * 2;
		let ifd_entry_count = 9u16;
		let ifd_size = 2 + ifd_entry_count as usize * 12 + 4;

		// Lay out: [header][ifd0][ifd1]...[description][plane0][plane1]...
		let ifds_start = 8usize;
		let description_start = ifds_start + planes.len() * ifd_size;
		let description_len = description.len();
		let mut plane_offset = description_start + description_len;
		// word-align strip data, harmless for this reader.
		if plane_offset % 2 != 0 {
			plane_offset += 1;
		}

		for (i, _) in planes.iter().enumerate() {
			let this_ifd_offset = ifds_start + i * ifd_size;
			assert_eq!(buf.len(), this_ifd_offset, "writer offset bookkeeping drifted");

			buf.write_u16::<LittleEndian>(ifd_entry_count).unwrap();

			let write_entry = |buf: &mut Vec<u8>, tag: u16, ty: u16, count: u32, value: u32| {
				buf.write_u16::<LittleEndian>(tag).unwrap();
				buf.write_u16::<LittleEndian>(ty).unwrap();
				buf.write_u32::<LittleEndian>(count).unwrap();
				buf.write_u32::<LittleEndian>(value).unwrap();
			};

			write_entry(&mut buf, TAG_IMAGE_WIDTH, TYPE_LONG, 1, dims.sx);
			write_entry(&mut buf, TAG_IMAGE_LENGTH, TYPE_LONG, 1, dims.sy);
			write_entry(&mut buf, TAG_BITS_PER_SAMPLE, TYPE_SHORT, 1, 16);
			write_entry(&mut buf, TAG_COMPRESSION, TYPE_SHORT, 1, 1);
			write_entry(&mut buf, TAG_SAMPLES_PER_PIXEL, TYPE_SHORT, 1, 1);
			write_entry(&mut buf, TAG_ROWS_PER_STRIP, TYPE_LONG, 1, dims.sy);
			write_entry(&mut buf, TAG_STRIP_OFFSETS, TYPE_LONG, 1, (plane_offset + i * plane_bytes) as u32);
			write_entry(&mut buf, TAG_STRIP_BYTE_COUNTS, TYPE_LONG, 1, plane_bytes as u32);
			if i == 0 {
				write_entry(&mut buf, TAG_IMAGE_DESCRIPTION, TYPE_ASCII, description_len as u32, description_start as u32);
			} else {
				write_entry(&mut buf, TAG_SAMPLE_FORMAT, TYPE_SHORT, 1, 1);
			}

			let next_ifd = if i + 1 < planes.len() { (ifds_start + (i + 1) * ifd_size) as u32 } else { 0 };
			buf.write_u32::<LittleEndian>(next_ifd).unwrap();
		}

		buf.extend_from_slice(&description);
		while buf.len() < plane_offset {
			buf.push(0);
		}
		for plane in planes {
			for &v in plane {
				buf.write_u16::<LittleEndian>(v).unwrap();
			}
		}

		let mut file = File::create(path).unwrap();
		file.write_all(&buf).unwrap();
	}

	#[test]
	fn probe_then_read_recovers_shape_dtype_and_voxel_size() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("volume.ome.tiff");

		let dims = Dimensions { sx: 4, sy: 3, sz: 2, sc: 1, st: 1 };
		let planes: Vec<Vec<u16>> = (0..dims.sz).map(|z| vec![(z + 1) as u16 * 100; (dims.sx * dims.sy) as usize]).collect();
		write_test_ome_tiff(&path, dims, (0.1, 0.1, 0.3), &planes);

		let probed = TiffReader::probe(&path).unwrap();
		assert_eq!(probed.dimensions, Some(dims));
		assert!((probed.voxel_size.z_um.unwrap() - 0.3).abs() < 1e-6);

		let (volume_or_chunked, read_metadata) = TiffReader::read(&path, ReadRequest::default(), false).unwrap();
		assert_eq!(read_metadata.dimensions, probed.dimensions);

		let tensor = match volume_or_chunked {
			VolumeOrChunked::Volume(t) => t,
			VolumeOrChunked::Chunked(_) => panic!("expected eager volume"),
		};
		assert_eq!(tensor.shape(), Shape4::new(1, 2, 3, 4));
		assert_eq!(tensor.dtype(), DType::U16);

		let data = tensor.to_host_f32();
		assert!(data[0..12].iter().all(|&v| v == 100.0));
		assert!(data[12..24].iter().all(|&v| v == 200.0));
	}

	#[test]
	fn out_of_range_timepoint_is_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("volume.tiff");
		let dims = Dimensions { sx: 2, sy: 2, sz: 1, sc: 1, st: 1 };
		write_test_ome_tiff(&path, dims, (1.0, 1.0, 1.0), &[vec![1u16; 4]]);

		let request = ReadRequest { timepoint: 5, ..Default::default() };
		let err = TiffReader::read(&path, request, false).unwrap_err();
		assert!(matches!(err, Error::OutOfRange { .. }));
	}

	#[test]
	fn bigtiff_magic_is_recognized_but_reported_unsupported() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("volume.tiff");
		let mut buf: Vec<u8> = Vec::new();
		buf.extend_from_slice(b"II");
		buf.write_u16::<LittleEndian>(43).unwrap();
		buf.write_u16::<LittleEndian>(8).unwrap();
		buf.write_u16::<LittleEndian>(0).unwrap();
		buf.write_u64::<LittleEndian>(16).unwrap();
		let mut file = File::create(&path).unwrap();
		file.write_all(&buf).unwrap();

		assert!(TiffReader::magic_matches(&buf));
		let err = TiffReader::probe(&path).unwrap_err();
		assert!(matches!(err, Error::UnsupportedFormat { .. }));
	}
}
