//! Zeiss CZI reader. CZI is a segment-based container: every top-level
//! segment starts with a 32-byte header (16-byte ASCII id, then `allocated_size`
//! and `used_size` as `i64`s) followed by a segment-specific payload. This
//! reader walks the segment chain far enough to find `ZISRAWMETADATA` (the
//! OME-like XML metadata block) for [`probe`]; full planar pixel decoding
//! (subblock JPEG-XR/zstd payloads) is out of scope and surfaces as
//! [`Error::MissingDependency`] from [`FormatReader::read`].

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use super::{FormatReader, ReadRequest, VolumeOrChunked};
use crate::error::{Error, Result};
use crate::metadata::{parse_ome_xml, Metadata};

pub struct CziReader;

const MAGIC: &[u8; 16] = b"ZISRAWFILE\0\0\0\0\0\0";
const SEGMENT_HEADER_LEN: u64 = 32;

fn io_err(path: &Path, e: std::io::Error) -> Error {
	Error::MalformedFile { path: path.display().to_string(), detail: e.to_string() }
}

/// Walks the segment chain from the start of the file, returning the file
/// offset of the payload for the first segment whose id matches `want`, or
/// `None` if the chain ends first.
fn find_segment(file: &mut File, path: &Path, want: &str) -> Result<Option<u64>> {
	let mut offset = 0u64;
	let mut header = [0u8; 32];

	loop {
		file.seek(SeekFrom::Start(offset)).map_err(|e| io_err(path, e))?;
		let n = file.read(&mut header).map_err(|e| io_err(path, e))?;
		if n < 32 {
			return Ok(None);
		}

		let id = String::from_utf8_lossy(&header[0..16]).trim_end_matches('\0').to_string();
		let allocated_size = LittleEndian::read_i64(&header[16..24]);
		if id == want {
			return Ok(Some(offset + SEGMENT_HEADER_LEN));
		}
		if allocated_size <= 0 {
			return Ok(None);
		}
		offset += SEGMENT_HEADER_LEN + allocated_size as u64;
	}
}

/// The `ZISRAWMETADATA` segment payload is `[xml_size: u32][attachment_size: u32][spare: 248 bytes][xml...]`.
fn read_metadata_xml(file: &mut File, path: &Path, payload_offset: u64) -> Result<String> {
	let mut sizes = [0u8; 8];
	file.seek(SeekFrom::Start(payload_offset)).map_err(|e| io_err(path, e))?;
	file.read_exact(&mut sizes).map_err(|e| io_err(path, e))?;
	let xml_size = LittleEndian::read_u32(&sizes[0..4]) as usize;

	let xml_offset = payload_offset + 8 + 248;
	let mut xml_bytes = vec![0u8; xml_size];
	file.seek(SeekFrom::Start(xml_offset)).map_err(|e| io_err(path, e))?;
	file.read_exact(&mut xml_bytes).map_err(|e| io_err(path, e))?;

	Ok(String::from_utf8_lossy(&xml_bytes).into_owned())
}

impl FormatReader for CziReader {
	fn extensions() -> &'static [&'static str] {
		&["czi"]
	}

	fn magic_matches(bytes: &[u8]) -> bool {
		bytes.len() >= 16 && &bytes[0..10] == &MAGIC[0..10]
	}

	fn probe(path: &Path) -> Result<Metadata> {
		let mut file = File::open(path).map_err(|e| io_err(path, e))?;
		let payload_offset = find_segment(&mut file, path, "ZISRAWMETADATA")?
			.ok_or_else(|| Error::MalformedFile { path: path.display().to_string(), detail: "no ZISRAWMETADATA segment found".into() })?;
		let xml = read_metadata_xml(&mut file, path, payload_offset)?;

		let metadata = parse_ome_xml(&xml);
		if metadata.dimensions.is_none() {
			return Err(Error::MalformedFile { path: path.display().to_string(), detail: "CZI metadata XML did not contain a recognizable Pixels element".into() });
		}
		metadata.validate().map_err(|e| Error::MalformedFile { path: path.display().to_string(), detail: e.to_string() })?;
		Ok(metadata)
	}

	fn read(_path: &Path, _request: ReadRequest, _lazy: bool) -> Result<(VolumeOrChunked, Metadata)> {
		Err(Error::MissingDependency { dependency: "CZI subblock pixel decoder (JPEG-XR/zstd)".into() })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use byteorder::WriteBytesExt;
	use std::io::Write;

	fn write_segment(buf: &mut Vec<u8>, id: &[u8; 16], payload: &[u8]) {
		buf.extend_from_slice(id);
		buf.write_i64::<LittleEndian>(payload.len() as i64).unwrap(); // allocated_size
		buf.write_i64::<LittleEndian>(payload.len() as i64).unwrap(); // used_size
		buf.extend_from_slice(payload);
	}

	fn id(s: &str) -> [u8; 16] {
		let mut out = [0u8; 16];
		out[..s.len()].copy_from_slice(s.as_bytes());
		out
	}

	#[test]
	fn probe_extracts_metadata_from_segment_chain() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("volume.czi");

		let xml = r#"<OME><Image><Pixels SizeX="128" SizeY="128" SizeZ="20" SizeC="2" SizeT="1" PhysicalSizeX="0.2" PhysicalSizeY="0.2" PhysicalSizeZ="0.5" SignificantBits="16" /></Image></OME>"#;
		let mut metadata_payload = vec![0u8; 8 + 248];
		LittleEndian::write_u32(&mut metadata_payload[0..4], xml.len() as u32);
		metadata_payload.extend_from_slice(xml.as_bytes());

		let mut buf = Vec::new();
		write_segment(&mut buf, &id("ZISRAWFILE"), &[0u8; 16]);
		write_segment(&mut buf, &id("ZISRAWMETADATA"), &metadata_payload);

		let mut file = File::create(&path).unwrap();
		file.write_all(&buf).unwrap();

		let metadata = CziReader::probe(&path).unwrap();
		assert_eq!(metadata.dimensions.unwrap().sz, 20);
		assert!((metadata.voxel_size.z_um.unwrap() - 0.5).abs() < 1e-6);
	}

	#[test]
	fn read_reports_missing_dependency() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("volume.czi");
		let mut buf = Vec::new();
		write_segment(&mut buf, &id("ZISRAWFILE"), &[0u8; 16]);
		std::fs::write(&path, &buf).unwrap();

		let err = CziReader::read(&path, ReadRequest::default(), false).unwrap_err();
		assert!(matches!(err, Error::MissingDependency { .. }));
	}
}
