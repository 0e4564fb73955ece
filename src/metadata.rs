//! Component metadata and its closed vocabulary.
//!
//! Metadata is the side-channel a component carries to describe how its data should be
//! interpreted downstream (pixel size, lens magnification, stage position, wavelengths...).
//! Exporters read it to embed into persisted data; they never mutate it directly.
//!
//! ## Vocabulary
//!
//! Keys are drawn from [`MetadataKey`], a closed enum. The vocabulary is versioned through
//! [`VOCABULARY_VERSION`], which is part of every component descriptor exchanged with a
//! remote peer. Inside Rust a key outside the vocabulary cannot be expressed at all; string
//! keys coming from the wire or from configuration files are parsed with
//! [`MetadataKey::from_str`] and rejected with [`DaqError::InvalidMetadataKey`].
//!
//! ## `MetadataBuilder`
//!
//! A `MetadataBuilder` assembles a `Metadata` map step by step, the same way a driver fills
//! in its static metadata at construction.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{DaqError, DaqResult};

/// Version of the metadata vocabulary. Bump whenever a key is added or removed.
pub const VOCABULARY_VERSION: u32 = 1;

/// Recognized metadata keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetadataKey {
    /// Acquisition date (RFC 3339 string).
    AcquisitionDate,
    /// Name of the hardware.
    HardwareName,
    /// Hardware (firmware) version.
    HardwareVersion,
    /// Driver software version.
    SoftwareVersion,
    /// Free-text description.
    Description,
    /// Exposure time in seconds.
    ExposureTime,
    /// Binning factor.
    Binning,
    /// Sensor gain.
    Gain,
    /// Readout time of one frame, in seconds.
    ReadoutTime,
    /// Bits per pixel.
    BitsPerPixel,
    /// Physical size of a sensor pixel in metres.
    SensorPixelSize,
    /// Size of a pixel in the sample plane, in metres.
    PixelSize,
    /// Scale factor applied to the pixel size by upstream optics.
    PixelSizeScale,
    /// Lens magnification.
    LensMagnification,
    /// Lens name.
    LensName,
    /// Stage position (metres).
    Position,
    /// Rotation (radians).
    Rotation,
    /// Wavelength range of the excitation light, in metres.
    InputWavelength,
    /// Wavelength range of the emission filter, in metres.
    OutputWavelength,
    /// Light power in watts.
    LightPower,
    /// Filter name.
    FilterName,
    /// Dwell time per pixel for scanning detectors, in seconds.
    DwellTime,
}

impl MetadataKey {
    /// Every key of the vocabulary, in declaration order.
    pub const ALL: [MetadataKey; 22] = [
        MetadataKey::AcquisitionDate,
        MetadataKey::HardwareName,
        MetadataKey::HardwareVersion,
        MetadataKey::SoftwareVersion,
        MetadataKey::Description,
        MetadataKey::ExposureTime,
        MetadataKey::Binning,
        MetadataKey::Gain,
        MetadataKey::ReadoutTime,
        MetadataKey::BitsPerPixel,
        MetadataKey::SensorPixelSize,
        MetadataKey::PixelSize,
        MetadataKey::PixelSizeScale,
        MetadataKey::LensMagnification,
        MetadataKey::LensName,
        MetadataKey::Position,
        MetadataKey::Rotation,
        MetadataKey::InputWavelength,
        MetadataKey::OutputWavelength,
        MetadataKey::LightPower,
        MetadataKey::FilterName,
        MetadataKey::DwellTime,
    ];

    /// Wire name of the key (e.g. `"PIXEL_SIZE_SCALE"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataKey::AcquisitionDate => "ACQUISITION_DATE",
            MetadataKey::HardwareName => "HARDWARE_NAME",
            MetadataKey::HardwareVersion => "HARDWARE_VERSION",
            MetadataKey::SoftwareVersion => "SOFTWARE_VERSION",
            MetadataKey::Description => "DESCRIPTION",
            MetadataKey::ExposureTime => "EXPOSURE_TIME",
            MetadataKey::Binning => "BINNING",
            MetadataKey::Gain => "GAIN",
            MetadataKey::ReadoutTime => "READOUT_TIME",
            MetadataKey::BitsPerPixel => "BITS_PER_PIXEL",
            MetadataKey::SensorPixelSize => "SENSOR_PIXEL_SIZE",
            MetadataKey::PixelSize => "PIXEL_SIZE",
            MetadataKey::PixelSizeScale => "PIXEL_SIZE_SCALE",
            MetadataKey::LensMagnification => "LENS_MAGNIFICATION",
            MetadataKey::LensName => "LENS_NAME",
            MetadataKey::Position => "POSITION",
            MetadataKey::Rotation => "ROTATION",
            MetadataKey::InputWavelength => "INPUT_WAVELENGTH",
            MetadataKey::OutputWavelength => "OUTPUT_WAVELENGTH",
            MetadataKey::LightPower => "LIGHT_POWER",
            MetadataKey::FilterName => "FILTER_NAME",
            MetadataKey::DwellTime => "DWELL_TIME",
        }
    }
}

impl fmt::Display for MetadataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetadataKey {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetadataKey::ALL
            .iter()
            .copied()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| DaqError::InvalidMetadataKey(s.to_string()))
    }
}

/// Metadata keyed by name, as exchanged on the wire and read from configuration files.
pub type RawMetadata = BTreeMap<String, Value>;

/// A metadata mapping restricted to the recognized vocabulary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata {
    entries: BTreeMap<MetadataKey, Value>,
}

impl Metadata {
    /// Create an empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a string-keyed mapping, rejecting the first key outside the vocabulary.
    pub fn try_from_raw(raw: RawMetadata) -> DaqResult<Self> {
        let mut entries = BTreeMap::new();
        for (key, value) in raw {
            entries.insert(key.parse::<MetadataKey>()?, value);
        }
        Ok(Self { entries })
    }

    /// String-keyed copy of this mapping.
    pub fn to_raw(&self) -> RawMetadata {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.clone()))
            .collect()
    }

    /// Insert or replace one entry.
    pub fn insert(&mut self, key: MetadataKey, value: impl Into<Value>) -> Option<Value> {
        self.entries.insert(key, value.into())
    }

    /// Look up one entry.
    pub fn get(&self, key: MetadataKey) -> Option<&Value> {
        self.entries.get(&key)
    }

    /// Look up a numeric entry.
    pub fn get_f64(&self, key: MetadataKey) -> Option<f64> {
        self.entries.get(&key).and_then(Value::as_f64)
    }

    /// Remove one entry.
    pub fn remove(&mut self, key: MetadataKey) -> Option<Value> {
        self.entries.remove(&key)
    }

    /// Merge `partial` into this mapping. Returns `true` if any entry actually changed.
    pub fn merge(&mut self, partial: &Metadata) -> bool {
        let mut changed = false;
        for (key, value) in &partial.entries {
            if self.entries.get(key) != Some(value) {
                self.entries.insert(*key, value.clone());
                changed = true;
            }
        }
        changed
    }

    /// Iterate over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&MetadataKey, &Value)> {
        self.entries.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(MetadataKey, Value)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (MetadataKey, Value)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// A builder for constructing `Metadata` instances.
#[derive(Default)]
pub struct MetadataBuilder {
    inner: Metadata,
}

impl MetadataBuilder {
    /// Start from an empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one entry.
    pub fn entry(mut self, key: MetadataKey, value: impl Into<Value>) -> Self {
        self.inner.insert(key, value);
        self
    }

    /// Set the hardware name.
    pub fn hardware_name(self, name: &str) -> Self {
        self.entry(MetadataKey::HardwareName, name)
    }

    /// Set the hardware version.
    pub fn hardware_version(self, version: &str) -> Self {
        self.entry(MetadataKey::HardwareVersion, version)
    }

    /// Set the software version to this crate's version.
    pub fn software_version(self) -> Self {
        self.entry(MetadataKey::SoftwareVersion, env!("CARGO_PKG_VERSION"))
    }

    /// Set the description.
    pub fn description(self, description: &str) -> Self {
        self.entry(MetadataKey::Description, description)
    }

    /// Finish.
    pub fn build(self) -> Metadata {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_names_round_trip() {
        for key in MetadataKey::ALL {
            assert_eq!(key.as_str().parse::<MetadataKey>().unwrap(), key);
            // serde and as_str must agree
            assert_eq!(serde_json::to_value(key).unwrap(), json!(key.as_str()));
        }
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut raw = RawMetadata::new();
        raw.insert("PIXEL_SIZE_SCALE".into(), json!(2.0));
        raw.insert("FAVOURITE_COLOUR".into(), json!("blue"));

        let err = Metadata::try_from_raw(raw).unwrap_err();
        assert_eq!(err, DaqError::InvalidMetadataKey("FAVOURITE_COLOUR".into()));
    }

    #[test]
    fn test_merge_reports_changes() {
        let mut md = MetadataBuilder::new()
            .hardware_name("Sim Camera")
            .entry(MetadataKey::Binning, 1)
            .build();

        let same = MetadataBuilder::new().entry(MetadataKey::Binning, 1).build();
        assert!(!md.merge(&same));

        let other = MetadataBuilder::new().entry(MetadataKey::Binning, 2).build();
        assert!(md.merge(&other));
        assert_eq!(md.get(MetadataKey::Binning), Some(&json!(2)));
        assert_eq!(md.len(), 2);
    }

    #[test]
    fn test_serialized_form_uses_wire_names() {
        let md = MetadataBuilder::new()
            .entry(MetadataKey::PixelSizeScale, 20.0)
            .build();
        let json = serde_json::to_value(&md).unwrap();
        assert_eq!(json, json!({"PIXEL_SIZE_SCALE": 20.0}));
        assert_eq!(md.to_raw().get("PIXEL_SIZE_SCALE"), Some(&json!(20.0)));
    }
}
