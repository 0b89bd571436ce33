//! Nikon ND2 reader. ND2 is a flat chunk container: a fixed magic number,
//! then a sequence of named chunks (`[name: 16 bytes ASCII][len: u32][data]`).
//! This reader walks that chunk list looking for the textual metadata
//! chunk (`ImageMetadataLV`) every recent NIS-Elements export carries and
//! parses its `key=value` lines opportunistically — real ND2 files also
//! carry a binary LIM-encoded attribute tree for the same fields, which is
//! not decoded here. Pixel data is vendor-compressed per-chunk and decoding
//! it is out of scope; [`FormatReader::read`] reports
//! [`Error::MissingDependency`].

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use super::{FormatReader, ReadRequest, VolumeOrChunked};
use crate::error::{Error, Result};
use crate::metadata::{Dimensions, Metadata};

pub struct Nd2Reader;

const MAGIC: [u8; 4] = [0xDA, 0xCE, 0xBE, 0x0A];
const METADATA_CHUNK_NAME: &str = "ImageMetadataLV";
const CHUNK_NAME_LEN: usize = 16;

fn io_err(path: &Path, e: std::io::Error) -> Error {
	Error::MalformedFile { path: path.display().to_string(), detail: e.to_string() }
}

fn find_metadata_chunk(file: &mut File, path: &Path) -> Result<Option<String>> {
	let mut offset = 4u64; // past the magic
	let mut name_buf = [0u8; CHUNK_NAME_LEN];
	let mut len_buf = [0u8; 4];

	loop {
		file.seek(SeekFrom::Start(offset)).map_err(|e| io_err(path, e))?;
		let n = file.read(&mut name_buf).map_err(|e| io_err(path, e))?;
		if n < CHUNK_NAME_LEN {
			return Ok(None);
		}
		let read_len = file.read(&mut len_buf).map_err(|e| io_err(path, e))?;
		if read_len < 4 {
			return Ok(None);
		}
		let data_len = LittleEndian::read_u32(&len_buf) as usize;
		let name = String::from_utf8_lossy(&name_buf).trim_end_matches('\0').to_string();

		if name == METADATA_CHUNK_NAME {
			let mut data = vec![0u8; data_len];
			file.read_exact(&mut data).map_err(|e| io_err(path, e))?;
			return Ok(Some(String::from_utf8_lossy(&data).into_owned()));
		}

		if data_len == 0 {
			return Ok(None);
		}
		offset += (CHUNK_NAME_LEN + 4 + data_len) as u64;
	}
}

fn parse_metadata_text(text: &str) -> Metadata {
	let mut metadata = Metadata::default();
	let mut sx = None;
	let mut sy = None;
	let mut sz = None;
	let mut sc = None;
	let mut st = None;
	let mut bits = None;

	for line in text.lines() {
		if let Some((k, v)) = line.split_once('=') {
			match k.trim() {
				"SizeX" => sx = v.trim().parse().ok(),
				"SizeY" => sy = v.trim().parse().ok(),
				"SizeZ" => sz = v.trim().parse().ok(),
				"SizeC" => sc = v.trim().parse().ok(),
				"SizeT" => st = v.trim().parse().ok(),
				"BitsPerSample" => bits = v.trim().parse().ok(),
				"PhysicalSizeX" => metadata.voxel_size.x_um = v.trim().parse().ok(),
				"PhysicalSizeY" => metadata.voxel_size.y_um = v.trim().parse().ok(),
				"PhysicalSizeZ" => metadata.voxel_size.z_um = v.trim().parse().ok(),
				_ => {}
			}
		}
	}

	if let (Some(sx), Some(sy)) = (sx, sy) {
		metadata.dimensions = Some(Dimensions {
			sx,
			sy,
			sz: sz.unwrap_or(1),
			sc: sc.unwrap_or(1),
			st: st.unwrap_or(1),
		});
	}
	metadata.bits_per_sample = bits;
	metadata
}

impl FormatReader for Nd2Reader {
	fn extensions() -> &'static [&'static str] {
		&["nd2"]
	}

	fn magic_matches(bytes: &[u8]) -> bool {
		bytes.len() >= 4 && bytes[0..4] == MAGIC
	}

	fn probe(path: &Path) -> Result<Metadata> {
		let mut file = File::open(path).map_err(|e| io_err(path, e))?;
		let text = find_metadata_chunk(&mut file, path)?
			.ok_or_else(|| Error::MalformedFile { path: path.display().to_string(), detail: "no ImageMetadataLV chunk found".into() })?;

		let metadata = parse_metadata_text(&text);
		if metadata.dimensions.is_none() {
			return Err(Error::MalformedFile { path: path.display().to_string(), detail: "ND2 metadata chunk did not contain SizeX/SizeY".into() });
		}
		metadata.validate().map_err(|e| Error::MalformedFile { path: path.display().to_string(), detail: e.to_string() })?;
		Ok(metadata)
	}

	fn read(_path: &Path, _request: ReadRequest, _lazy: bool) -> Result<(VolumeOrChunked, Metadata)> {
		Err(Error::MissingDependency { dependency: "ND2 LIM-encoded pixel chunk decoder".into() })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use byteorder::WriteBytesExt;
	use std::io::Write;

	fn write_chunk(buf: &mut Vec<u8>, name: &str, data: &[u8]) {
		let mut name_buf = [0u8; CHUNK_NAME_LEN];
		name_buf[..name.len()].copy_from_slice(name.as_bytes());
		buf.extend_from_slice(&name_buf);
		buf.write_u32::<LittleEndian>(data.len() as u32).unwrap();
		buf.extend_from_slice(data);
	}

	#[test]
	fn probe_parses_metadata_chunk() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("volume.nd2");

		let text = "SizeX=256\nSizeY=256\nSizeZ=40\nSizeC=2\nSizeT=1\nBitsPerSample=16\nPhysicalSizeZ=0.4\n";
		let mut buf = MAGIC.to_vec();
		write_chunk(&mut buf, METADATA_CHUNK_NAME, text.as_bytes());
		std::fs::write(&path, &buf).unwrap();

		let metadata = Nd2Reader::probe(&path).unwrap();
		let dims = metadata.dimensions.unwrap();
		assert_eq!(dims.sz, 40);
		assert_eq!(dims.sc, 2);
		assert_eq!(metadata.bits_per_sample, Some(16));
	}

	#[test]
	fn read_reports_missing_dependency() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("volume.nd2");
		let mut buf = MAGIC.to_vec();
		write_chunk(&mut buf, METADATA_CHUNK_NAME, b"SizeX=8\nSizeY=8\n");
		std::fs::write(&path, &buf).unwrap();

		let err = Nd2Reader::read(&path, ReadRequest::default(), false).unwrap_err();
		assert!(matches!(err, Error::MissingDependency { .. }));
	}
}
