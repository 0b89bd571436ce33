//! Leica LIF reader. A LIF file is a sequence of memory blocks, each
//! introduced by `[0x70 marker: i32][block size: i32][0x2A: u8][xml char
//! count: i32][UTF-16LE XML]`; the first block's XML is the whole
//! experiment tree (`<Element>`/`<Image>`/`<Dimensions>`/`<Channels>`).
//! This reader extracts dimensions and bit depth from that first XML block
//! for [`probe`]; raw pixel memory blocks are not decoded, and
//! [`FormatReader::read`] reports [`Error::MissingDependency`].

use std::fs::File;
use std::io::Read;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use quick_xml::events::Event;
use quick_xml::reader::Reader;

use super::{FormatReader, ReadRequest, VolumeOrChunked};
use crate::error::{Error, Result};
use crate::metadata::{Dimensions, Metadata};

pub struct LifReader;

const BLOCK_MARKER: i32 = 0x70;
const XML_MARKER_BYTE: u8 = 0x2A;

fn io_err(path: &Path, e: std::io::Error) -> Error {
	Error::MalformedFile { path: path.display().to_string(), detail: e.to_string() }
}

fn read_first_xml_block(path: &Path) -> Result<String> {
	let mut file = File::open(path).map_err(|e| io_err(path, e))?;
	let mut header = [0u8; 9];
	file.read_exact(&mut header).map_err(|e| io_err(path, e))?;

	let marker = LittleEndian::read_i32(&header[0..4]);
	if marker != BLOCK_MARKER {
		return Err(Error::MalformedFile { path: path.display().to_string(), detail: format!("expected LIF block marker 0x70, found {marker:#x}") });
	}
	if header[8] != XML_MARKER_BYTE {
		return Err(Error::MalformedFile { path: path.display().to_string(), detail: "missing LIF 0x2A XML marker byte".into() });
	}

	let mut char_count_buf = [0u8; 4];
	file.read_exact(&mut char_count_buf).map_err(|e| io_err(path, e))?;
	let char_count = LittleEndian::read_i32(&char_count_buf) as usize;

	let mut utf16_bytes = vec![0u8; char_count * 2];
	file.read_exact(&mut utf16_bytes).map_err(|e| io_err(path, e))?;

	let units: Vec<u16> = utf16_bytes.chunks(2).map(|c| LittleEndian::read_u16(c)).collect();
	String::from_utf16(&units).map_err(|e| Error::MalformedFile { path: path.display().to_string(), detail: format!("LIF XML block is not valid UTF-16: {e}") })
}

/// `Length` on a `DimensionDescription` is the element's total physical
/// extent in meters; divided by element count it gives per-voxel spacing.
fn parse_lif_xml(xml: &str) -> Metadata {
	let mut reader = Reader::from_str(xml);
	reader.config_mut().trim_text(true);

	let mut metadata = Metadata::default();
	let (mut sx, mut sy, mut sz, mut st) = (None, None, None, None);
	let (mut x_um, mut y_um, mut z_um) = (None, None, None);
	let mut channel_count = 0u32;
	let mut buf = Vec::new();

	loop {
		match reader.read_event_into(&mut buf) {
			Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
				let local = e.name();
				let name = String::from_utf8_lossy(local.as_ref()).into_owned();
				let attrs: std::collections::HashMap<String, String> = e
					.attributes()
					.flatten()
					.filter_map(|a| {
						let key = String::from_utf8(a.key.as_ref().to_vec()).ok()?;
						let value = a.unescape_value().ok()?.into_owned();
						Some((key, value))
					})
					.collect();

				if name == "DimensionDescription" {
					let dim_id = attrs.get("DimID").and_then(|v| v.parse::<u32>().ok());
					let n = attrs.get("NumberOfElements").and_then(|v| v.parse::<u32>().ok());
					let length_m = attrs.get("Length").and_then(|v| v.parse::<f64>().ok());
					let spacing_um = match (n, length_m) {
						(Some(n), Some(length_m)) if n > 1 => Some(length_m / (n - 1) as f64 * 1_000_000.0),
						_ => None,
					};
					match dim_id {
						Some(1) => {
							sx = n;
							x_um = spacing_um;
						}
						Some(2) => {
							sy = n;
							y_um = spacing_um;
						}
						Some(3) => {
							sz = n;
							z_um = spacing_um;
						}
						Some(4) => st = n,
						_ => {}
					}
				} else if name == "ChannelDescription" {
					channel_count += 1;
					if metadata.bits_per_sample.is_none() {
						if let Some(bits) = attrs.get("Resolution").and_then(|v| v.parse::<u16>().ok()) {
							metadata.bits_per_sample = Some(bits);
						}
					}
				}
			}
			Ok(Event::Eof) => break,
			Err(_) => break,
			_ => {}
		}
		buf.clear();
	}

	if let (Some(sx), Some(sy)) = (sx, sy) {
		metadata.dimensions = Some(Dimensions {
			sx,
			sy,
			sz: sz.unwrap_or(1),
			sc: channel_count.max(1),
			st: st.unwrap_or(1),
		});
	}
	metadata.voxel_size.x_um = x_um;
	metadata.voxel_size.y_um = y_um;
	metadata.voxel_size.z_um = z_um;

	metadata
}

impl FormatReader for LifReader {
	fn extensions() -> &'static [&'static str] {
		&["lif"]
	}

	fn magic_matches(bytes: &[u8]) -> bool {
		bytes.len() >= 4 && LittleEndian::read_i32(&bytes[0..4]) == BLOCK_MARKER
	}

	fn probe(path: &Path) -> Result<Metadata> {
		let xml = read_first_xml_block(path)?;
		let metadata = parse_lif_xml(&xml);
		if metadata.dimensions.is_none() {
			return Err(Error::MalformedFile { path: path.display().to_string(), detail: "LIF XML block did not contain DimensionDescription X/Y".into() });
		}
		metadata.validate().map_err(|e| Error::MalformedFile { path: path.display().to_string(), detail: e.to_string() })?;
		Ok(metadata)
	}

	fn read(_path: &Path, _request: ReadRequest, _lazy: bool) -> Result<(VolumeOrChunked, Metadata)> {
		Err(Error::MissingDependency { dependency: "LIF raw memory-block pixel decoder".into() })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use byteorder::WriteBytesExt;
	use std::io::Write;

	fn write_lif_header(xml: &str) -> Vec<u8> {
		let units: Vec<u16> = xml.encode_utf16().collect();
		let mut buf = Vec::new();
		buf.write_i32::<LittleEndian>(BLOCK_MARKER).unwrap();
		buf.write_i32::<LittleEndian>(0).unwrap(); // block size, unused by the reader
		buf.push(XML_MARKER_BYTE);
		buf.write_i32::<LittleEndian>(units.len() as i32).unwrap();
		for u in units {
			buf.write_u16::<LittleEndian>(u).unwrap();
		}
		buf
	}

	#[test]
	fn probe_parses_dimensions_and_channel_count() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("volume.lif");

		let xml = r#"<LMSDataContainerHeader><Element><Data><Image>
			<ImageDescription>
				<Channels>
					<ChannelDescription Resolution="16" />
					<ChannelDescription Resolution="16" />
				</Channels>
				<Dimensions>
					<DimensionDescription DimID="1" NumberOfElements="256" Length="0.0000256" />
					<DimensionDescription DimID="2" NumberOfElements="256" Length="0.0000256" />
					<DimensionDescription DimID="3" NumberOfElements="30" Length="0.0000087" />
				</Dimensions>
			</ImageDescription>
		</Image></Data></Element></LMSDataContainerHeader>"#;

		std::fs::write(&path, write_lif_header(xml)).unwrap();

		let metadata = LifReader::probe(&path).unwrap();
		let dims = metadata.dimensions.unwrap();
		assert_eq!(dims.sx, 256);
		assert_eq!(dims.sz, 30);
		assert_eq!(dims.sc, 2);
		assert_eq!(metadata.bits_per_sample, Some(16));
	}

	#[test]
	fn read_reports_missing_dependency() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("volume.lif");
		let xml = r#"<LMSDataContainerHeader></LMSDataContainerHeader>"#;
		std::fs::write(&path, write_lif_header(xml)).unwrap();

		let err = LifReader::read(&path, ReadRequest::default(), false).unwrap_err();
		assert!(matches!(err, Error::MissingDependency { .. }));
	}
}
