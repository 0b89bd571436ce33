//! Normalized metadata schema (spec component H). Vendor-specific fields
//! are parsed opportunistically; missing fields are `None`, never a parse
//! error. Physical units are stored internally in micrometers.

use std::collections::HashMap;

use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::error::{Error, Result};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PhysicalVoxelSize {
	pub x_um: Option<f64>,
	pub y_um: Option<f64>,
	pub z_um: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChannelInfo {
	pub name: Option<String>,
	pub excitation_nm: Option<f64>,
	pub emission_nm: Option<f64>,
	pub fluorophore: Option<String>,
	pub color_hint: Option<[u8; 3]>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Objective {
	pub magnification: Option<f64>,
	pub numerical_aperture: Option<f64>,
	pub immersion: Option<String>,
	pub working_distance_mm: Option<f64>,
}

/// Dimension sizes, all >= 1 for a valid record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dimensions {
	pub sx: u32,
	pub sy: u32,
	pub sz: u32,
	pub sc: u32,
	pub st: u32,
}

impl Dimensions {
	pub fn is_valid(&self) -> bool {
		self.sx >= 1 && self.sy >= 1 && self.sz >= 1 && self.sc >= 1 && self.st >= 1
	}
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Metadata {
	pub dimensions: Option<Dimensions>,
	pub bits_per_sample: Option<u16>,
	pub voxel_size: PhysicalVoxelSize,
	pub channels: Vec<ChannelInfo>,
	pub objective: Objective,
	pub microscope: Option<String>,
	pub acquisition_timestamp: Option<String>,
	pub raw_vendor_blob: Vec<u8>,
}

impl Metadata {
	pub fn validate(&self) -> Result<()> {
		if let Some(dims) = self.dimensions {
			if !dims.is_valid() {
				return Err(Error::shape(format!("metadata dimensions must all be >= 1, got {dims:?}")));
			}
		}
		for (label, value) in [
			("voxel_size.x_um", self.voxel_size.x_um),
			("voxel_size.y_um", self.voxel_size.y_um),
			("voxel_size.z_um", self.voxel_size.z_um),
		] {
			if let Some(v) = value {
				if !(v.is_finite() && v > 0.0) {
					return Err(Error::shape(format!("{label} must be positive and finite, got {v}")));
				}
			}
		}
		Ok(())
	}
}

/// Merge precedence: OME-XML overrides container-native fields, which
/// override filename heuristics. Each field is taken from the
/// highest-precedence source that actually populated it.
pub fn merge_precedence(ome_xml: Option<Metadata>, container_native: Option<Metadata>, filename_heuristic: Option<Metadata>) -> Metadata {
	let sources = [ome_xml, container_native, filename_heuristic];

	let mut merged = Metadata::default();
	for source in sources.into_iter().flatten() {
		if merged.dimensions.is_none() {
			merged.dimensions = source.dimensions;
		}
		if merged.bits_per_sample.is_none() {
			merged.bits_per_sample = source.bits_per_sample;
		}
		if merged.voxel_size.x_um.is_none() {
			merged.voxel_size.x_um = source.voxel_size.x_um;
		}
		if merged.voxel_size.y_um.is_none() {
			merged.voxel_size.y_um = source.voxel_size.y_um;
		}
		if merged.voxel_size.z_um.is_none() {
			merged.voxel_size.z_um = source.voxel_size.z_um;
		}
		if merged.channels.is_empty() {
			merged.channels = source.channels;
		}
		if merged.objective == Objective::default() {
			merged.objective = source.objective;
		}
		if merged.microscope.is_none() {
			merged.microscope = source.microscope;
		}
		if merged.acquisition_timestamp.is_none() {
			merged.acquisition_timestamp = source.acquisition_timestamp;
		}
		if merged.raw_vendor_blob.is_empty() {
			merged.raw_vendor_blob = source.raw_vendor_blob;
		}
	}
	merged
}

/// Extracts the subset of OME-XML this crate cares about: the first
/// `<Pixels>` element's size and physical-size attributes. Unknown or
/// malformed OME-XML yields a `Metadata` with the relevant fields left
/// `None` rather than an error — OME-XML absence/corruption is common in
/// vendor files that merely claim OME compatibility.
pub fn parse_ome_xml(xml: &str) -> Metadata {
	let mut reader = Reader::from_str(xml);
	reader.config_mut().trim_text(true);

	let mut metadata = Metadata::default();
	let mut buf = Vec::new();

	loop {
		match reader.read_event_into(&mut buf) {
			Ok(Event::Empty(e)) | Ok(Event::Start(e)) if e.name().as_ref() == b"Pixels" => {
				let attrs: HashMap<String, String> = e
					.attributes()
					.flatten()
					.filter_map(|a| {
						let key = String::from_utf8(a.key.as_ref().to_vec()).ok()?;
						let value = a.unescape_value().ok()?.into_owned();
						Some((key, value))
					})
					.collect();

				let parse_u32 = |k: &str| attrs.get(k).and_then(|v| v.parse::<u32>().ok());
				let parse_f64 = |k: &str| attrs.get(k).and_then(|v| v.parse::<f64>().ok());

				if let (Some(sx), Some(sy), Some(sz), Some(sc), Some(st)) = (
					parse_u32("SizeX"),
					parse_u32("SizeY"),
					parse_u32("SizeZ"),
					parse_u32("SizeC"),
					parse_u32("SizeT"),
				) {
					metadata.dimensions = Some(Dimensions { sx, sy, sz, sc, st });
				}

				metadata.voxel_size.x_um = parse_f64("PhysicalSizeX");
				metadata.voxel_size.y_um = parse_f64("PhysicalSizeY");
				metadata.voxel_size.z_um = parse_f64("PhysicalSizeZ");

				if let Some(bits) = attrs.get("SignificantBits").and_then(|v| v.parse::<u16>().ok()) {
					metadata.bits_per_sample = Some(bits);
				}

				break;
			}
			Ok(Event::Eof) => break,
			Err(_) => break,
			_ => {}
		}
		buf.clear();
	}

	metadata
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ome_xml_precedence_wins_over_native() {
		let ome = Metadata { microscope: Some("ome".into()), ..Default::default() };
		let native = Metadata { microscope: Some("native".into()), ..Default::default() };
		let merged = merge_precedence(Some(ome), Some(native), None);
		assert_eq!(merged.microscope.as_deref(), Some("ome"));
	}

	#[test]
	fn missing_field_falls_through_to_lower_precedence() {
		let ome = Metadata::default();
		let native = Metadata { microscope: Some("native".into()), ..Default::default() };
		let merged = merge_precedence(Some(ome), Some(native), None);
		assert_eq!(merged.microscope.as_deref(), Some("native"));
	}

	#[test]
	fn parses_pixels_element() {
		let xml = r#"<OME><Image><Pixels SizeX="512" SizeY="512" SizeZ="50" SizeC="2" SizeT="1" PhysicalSizeX="0.1" PhysicalSizeY="0.1" PhysicalSizeZ="0.3" SignificantBits="16" /></Image></OME>"#;
		let metadata = parse_ome_xml(xml);
		assert_eq!(metadata.dimensions, Some(Dimensions { sx: 512, sy: 512, sz: 50, sc: 2, st: 1 }));
		assert_eq!(metadata.voxel_size.z_um, Some(0.3));
		assert_eq!(metadata.bits_per_sample, Some(16));
	}

	#[test]
	fn validate_rejects_non_positive_voxel_size() {
		let mut metadata = Metadata::default();
		metadata.voxel_size.x_um = Some(-1.0);
		assert!(metadata.validate().is_err());
	}
}
