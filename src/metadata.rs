//! Volume metadata: the shape, element type, and axis description of a
//! remote volume, plus the JSON wire format it travels in.
//!
//! The wire format is a two-key JSON object: `Axes` describes the
//! non-channel axes in fortran order, and `Values` carries one entry per
//! channel.  The channel axis itself is implicit in `Values` and is
//! always prepended as axis 0 of the in-memory shape, with axis key
//! `'c'`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{Error, Result};

/// Element type of a stored voxel.
///
/// The wire names are the ones used in the `DataType` field of the
/// metadata JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl DataType {
    /// Size of one element, in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::U8 => 1,
            DataType::U16 => 2,
            DataType::U32 | DataType::F32 => 4,
            DataType::U64 | DataType::F64 => 8,
        }
    }

    /// The name used for this type in metadata JSON.
    pub fn wire_name(&self) -> &'static str {
        match self {
            DataType::U8 => "uint8",
            DataType::U16 => "uint16",
            DataType::U32 => "uint32",
            DataType::U64 => "uint64",
            DataType::F32 => "float32",
            DataType::F64 => "float64",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<DataType> {
        match name {
            "uint8" => Some(DataType::U8),
            "uint16" => Some(DataType::U16),
            "uint32" => Some(DataType::U32),
            "uint64" => Some(DataType::U64),
            "float32" => Some(DataType::F32),
            "float64" => Some(DataType::F64),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire_name())
    }
}

/// Description of one non-channel axis.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisInfo {
    pub label: String,
    pub resolution: f64,
    pub units: String,
}

/// Metadata describing a remote voxel volume.
///
/// `shape` and `axiskeys` always include the channel axis at index 0.
/// Instances are replaced, never mutated: after a write that grows the
/// remote volume, a fresh `VolumeMetadata` is fetched (client) or built
/// with [`VolumeMetadata::with_shape`] (server).
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeMetadata {
    /// Extent per axis; `shape[0]` is the channel count.
    pub shape: Vec<usize>,
    pub dtype: DataType,
    /// Fortran-order axis labels, e.g. `"cxyz"`.  Always starts with `c`.
    pub axiskeys: String,
    /// Per-axis resolution/units, for the non-channel axes.
    pub axes: Vec<AxisInfo>,
    /// One label per channel.  (First-class here; the wire format keeps
    /// them inside `Values`.)
    pub channel_labels: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct WireAxis {
    #[serde(rename = "Label")]
    label: String,
    #[serde(rename = "Resolution")]
    resolution: f64,
    #[serde(rename = "Units")]
    units: String,
    #[serde(rename = "Size")]
    size: usize,
}

#[derive(Serialize, Deserialize)]
struct WireValue {
    #[serde(rename = "DataType")]
    data_type: String,
    #[serde(rename = "Label")]
    label: String,
}

#[derive(Serialize, Deserialize)]
struct WireMetadata {
    #[serde(rename = "Axes")]
    axes: Vec<WireAxis>,
    #[serde(rename = "Values")]
    values: Vec<WireValue>,
}

impl VolumeMetadata {
    /// Parse metadata from its JSON wire form.
    ///
    /// Fails with [`Error::MalformedMetadata`] if required fields are
    /// missing, no channels are declared, the element type is unknown,
    /// or the per-channel element types are not all identical.
    pub fn from_json(text: &str) -> Result<VolumeMetadata> {
        let wire: WireMetadata = serde_json::from_str(text)
            .map_err(|e| Error::MalformedMetadata(e.to_string()))?;

        if wire.values.is_empty() {
            return Err(Error::MalformedMetadata(
                "metadata declares no channels (empty Values)".to_string(),
            ));
        }

        let first_name = wire.values[0].data_type.as_str();
        if !wire.values.iter().all(|v| v.data_type == first_name) {
            let names: Vec<&str> = wire.values.iter().map(|v| v.data_type.as_str()).collect();
            return Err(Error::MalformedMetadata(format!(
                "heterogeneous channel element types are not supported: {:?}",
                names
            )));
        }
        let dtype = DataType::from_wire_name(first_name).ok_or_else(|| {
            Error::MalformedMetadata(format!("unknown element type: {}", first_name))
        })?;

        let mut shape = Vec::with_capacity(1 + wire.axes.len());
        let mut axiskeys = String::from("c");
        shape.push(wire.values.len());
        let mut axes = Vec::with_capacity(wire.axes.len());
        for axis in &wire.axes {
            axiskeys.push_str(&axis.label.to_lowercase());
            shape.push(axis.size);
            axes.push(AxisInfo {
                label: axis.label.clone(),
                resolution: axis.resolution,
                units: axis.units.clone(),
            });
        }

        Ok(VolumeMetadata {
            shape,
            dtype,
            axiskeys,
            axes,
            channel_labels: wire.values.into_iter().map(|v| v.label).collect(),
        })
    }

    /// Serialize back to the JSON wire form.
    pub fn to_json(&self) -> String {
        let wire = WireMetadata {
            axes: self
                .axes
                .iter()
                .zip(self.shape[1..].iter())
                .map(|(axis, &size)| WireAxis {
                    label: axis.label.clone(),
                    resolution: axis.resolution,
                    units: axis.units.clone(),
                    size,
                })
                .collect(),
            values: self
                .channel_labels
                .iter()
                .map(|label| WireValue {
                    data_type: self.dtype.wire_name().to_string(),
                    label: label.clone(),
                })
                .collect(),
        };
        // WireMetadata contains nothing a Serializer can reject.
        serde_json::to_string(&wire).expect("metadata serialization cannot fail")
    }

    /// Build metadata from scratch with uniform resolution and units.
    ///
    /// `axiskeys` must start with `'c'` and have one key per entry in
    /// `shape`.  Axis labels are the uppercased non-channel keys, so
    /// `create_default(&[3, 10, 20], U8, "cxy", 1.0, "")` yields axes
    /// labelled `X` and `Y` with three channels.
    pub fn create_default(
        shape: &[usize],
        dtype: DataType,
        axiskeys: &str,
        resolution: f64,
        units: &str,
    ) -> Result<VolumeMetadata> {
        if axiskeys.len() != shape.len() {
            return Err(Error::MalformedMetadata(format!(
                "shape has {} axes but axiskeys {:?} has {}",
                shape.len(),
                axiskeys,
                axiskeys.len()
            )));
        }
        if !axiskeys.starts_with('c') {
            return Err(Error::MalformedMetadata(format!(
                "channel axis must be first: axiskeys {:?} does not start with 'c'",
                axiskeys
            )));
        }
        if shape[0] == 0 {
            return Err(Error::MalformedMetadata(
                "channel count must be at least 1".to_string(),
            ));
        }

        let axes = axiskeys
            .chars()
            .skip(1)
            .map(|key| AxisInfo {
                label: key.to_uppercase().to_string(),
                resolution,
                units: units.to_string(),
            })
            .collect();

        Ok(VolumeMetadata {
            shape: shape.to_vec(),
            dtype,
            axiskeys: axiskeys.to_string(),
            axes,
            channel_labels: vec![String::new(); shape[0]],
        })
    }

    /// Replacement constructor used after a bounds-growing write.
    pub fn with_shape(&self, new_shape: Vec<usize>) -> VolumeMetadata {
        let mut replacement = self.clone();
        replacement.shape = new_shape;
        replacement
    }

    /// Number of axes, including the channel axis.
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn num_channels(&self) -> usize {
        self.shape[0]
    }

    /// Map this volume's `(dtype, channel count)` to the storage-type
    /// tag used in creation URLs.
    pub fn storage_typename(&self) -> Result<&'static str> {
        match (self.dtype, self.num_channels()) {
            (DataType::U8, 1) => Ok("grayscale8"),
            (DataType::U32, 1) => Ok("labels32"),
            (DataType::U64, 1) => Ok("labels64"),
            (DataType::U8, 3) => Ok("rgb8"),
            (DataType::U8, 4) => Ok("rgba8"),
            (dtype, channels) => Err(Error::UnsupportedType {
                dtype: dtype.wire_name(),
                channels,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RGB_JSON: &str = r#"{
        "Axes": [
            {"Label": "X", "Resolution": 3.1, "Units": "nanometers", "Size": 100},
            {"Label": "Y", "Resolution": 3.1, "Units": "nanometers", "Size": 200},
            {"Label": "Z", "Resolution": 40.0, "Units": "nanometers", "Size": 400}
        ],
        "Values": [
            {"DataType": "uint8", "Label": "intensity-R"},
            {"DataType": "uint8", "Label": "intensity-G"},
            {"DataType": "uint8", "Label": "intensity-B"}
        ]
    }"#;

    #[test]
    fn parse_metadata() {
        let meta = VolumeMetadata::from_json(RGB_JSON).unwrap();
        assert_eq!(meta.shape, vec![3, 100, 200, 400]);
        assert_eq!(meta.dtype, DataType::U8);
        assert_eq!(meta.axiskeys, "cxyz");
        assert_eq!(meta.axes[2].resolution, 40.0);
        assert_eq!(
            meta.channel_labels,
            vec!["intensity-R", "intensity-G", "intensity-B"]
        );
    }

    #[test]
    fn json_roundtrip() {
        let meta = VolumeMetadata::from_json(RGB_JSON).unwrap();
        let reparsed = VolumeMetadata::from_json(&meta.to_json()).unwrap();
        assert_eq!(meta, reparsed);
    }

    #[test]
    fn missing_field_is_malformed() {
        let err = VolumeMetadata::from_json(r#"{"Axes": []}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedMetadata(_)));
    }

    #[test]
    fn empty_values_is_malformed() {
        let err = VolumeMetadata::from_json(r#"{"Axes": [], "Values": []}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedMetadata(_)));
    }

    #[test]
    fn heterogeneous_channels_are_malformed() {
        let text = r#"{
            "Axes": [{"Label": "X", "Resolution": 1.0, "Units": "", "Size": 5}],
            "Values": [
                {"DataType": "uint8", "Label": ""},
                {"DataType": "uint32", "Label": ""}
            ]
        }"#;
        let err = VolumeMetadata::from_json(text).unwrap_err();
        assert!(matches!(err, Error::MalformedMetadata(_)));
    }

    #[test]
    fn create_default_invariants() {
        let meta =
            VolumeMetadata::create_default(&[3, 10, 20], DataType::U8, "cxy", 1.5, "micrometers")
                .unwrap();
        assert_eq!(meta.shape, vec![3, 10, 20]);
        assert_eq!(meta.axes[0].label, "X");
        assert_eq!(meta.axes[1].units, "micrometers");
        assert_eq!(meta.channel_labels.len(), 3);

        // Channel axis must come first.
        assert!(VolumeMetadata::create_default(&[10, 3], DataType::U8, "xc", 1.0, "").is_err());
        // One key per axis.
        assert!(VolumeMetadata::create_default(&[3, 10], DataType::U8, "cxy", 1.0, "").is_err());
    }

    #[test]
    fn storage_typenames() {
        let gray =
            VolumeMetadata::create_default(&[1, 10, 10], DataType::U8, "cxy", 1.0, "").unwrap();
        assert_eq!(gray.storage_typename().unwrap(), "grayscale8");

        let rgba =
            VolumeMetadata::create_default(&[4, 10, 10], DataType::U8, "cxy", 1.0, "").unwrap();
        assert_eq!(rgba.storage_typename().unwrap(), "rgba8");

        let labels =
            VolumeMetadata::create_default(&[1, 10, 10], DataType::U64, "cxy", 1.0, "").unwrap();
        assert_eq!(labels.storage_typename().unwrap(), "labels64");

        let odd =
            VolumeMetadata::create_default(&[2, 10, 10], DataType::F32, "cxy", 1.0, "").unwrap();
        assert!(matches!(
            odd.storage_typename().unwrap_err(),
            Error::UnsupportedType { channels: 2, .. }
        ));
    }

    #[test]
    fn with_shape_replaces() {
        let meta =
            VolumeMetadata::create_default(&[3, 10, 20], DataType::U32, "cxy", 1.0, "").unwrap();
        let grown = meta.with_shape(vec![3, 50, 20]);
        assert_eq!(grown.shape, vec![3, 50, 20]);
        assert_eq!(meta.shape, vec![3, 10, 20]);
        assert_eq!(grown.dtype, meta.dtype);
    }
}
