//! In-memory dense-array store backing the reference server.
//!
//! Layout trick: a volume's bytes live in an `ArrayD<u8>` whose first
//! axis is the element size in bytes, followed by the volume's own
//! axes (channel first), all in fortran order.  Flattening any region
//! of that array in column-major order therefore yields exactly the
//! wire encoding: little-endian element bytes, channel varying fastest,
//! no header.  The store never needs to know more about the element
//! type than its width.

use std::collections::HashMap;

use ndarray::{ArrayD, ArrayViewMutD, Axis, IxDyn, ShapeBuilder, Slice};
use thiserror::Error;

use crate::metadata::VolumeMetadata;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no such node: {0}")]
    UnknownNode(String),
    #[error("no such volume: {0}/{1}")]
    UnknownVolume(String, String),
    #[error("volume already exists: {0}/{1}")]
    DuplicateVolume(String, String),
    #[error("{0}")]
    BadRegion(String),
}

type StoreResult<T> = std::result::Result<T, StoreError>;

struct Volume {
    metadata: VolumeMetadata,
    /// Shape `[element_size] + metadata.shape`, fortran order.
    data: ArrayD<u8>,
}

impl Volume {
    fn new(metadata: VolumeMetadata) -> Volume {
        let data = ArrayD::zeros(full_shape(&metadata).f());
        Volume { metadata, data }
    }
}

fn full_shape(metadata: &VolumeMetadata) -> IxDyn {
    let mut shape = Vec::with_capacity(1 + metadata.rank());
    shape.push(metadata.dtype.size_in_bytes());
    shape.extend_from_slice(&metadata.shape);
    IxDyn(&shape)
}

/// Restrict a mutable view to `[start, stop)` per axis, byte axis
/// included in full.
fn restrict<'a>(
    mut view: ArrayViewMutD<'a, u8>,
    start: &[usize],
    stop: &[usize],
) -> ArrayViewMutD<'a, u8> {
    for (axis, (&a, &b)) in start.iter().zip(stop).enumerate() {
        view.slice_axis_inplace(Axis(axis + 1), Slice::new(a as isize, Some(b as isize), 1));
    }
    view
}

/// The dense-array store: node uuids, each holding named volumes.
#[derive(Default)]
pub struct VolumeStore {
    nodes: HashMap<String, HashMap<String, Volume>>,
}

impl VolumeStore {
    pub fn new() -> VolumeStore {
        VolumeStore::default()
    }

    /// Register a node uuid.  Volumes can only be created under known
    /// nodes; node management itself is outside the protocol.
    pub fn add_node(&mut self, uuid: &str) {
        self.nodes.entry(uuid.to_string()).or_default();
    }

    pub fn has_node(&self, uuid: &str) -> bool {
        self.nodes.contains_key(uuid)
    }

    /// Allocate a new zero-filled volume described by `metadata`.
    pub fn create_volume(
        &mut self,
        uuid: &str,
        name: &str,
        metadata: VolumeMetadata,
    ) -> StoreResult<()> {
        let node = self
            .nodes
            .get_mut(uuid)
            .ok_or_else(|| StoreError::UnknownNode(uuid.to_string()))?;
        if node.contains_key(name) {
            return Err(StoreError::DuplicateVolume(
                uuid.to_string(),
                name.to_string(),
            ));
        }
        node.insert(name.to_string(), Volume::new(metadata));
        Ok(())
    }

    pub fn metadata(&self, uuid: &str, name: &str) -> StoreResult<&VolumeMetadata> {
        Ok(&self.volume(uuid, name)?.metadata)
    }

    /// Read the dense region `[start, stop)` (all axes, channel first)
    /// as wire-encoded bytes.
    pub fn read_region(&self, uuid: &str, name: &str, start: &[usize], stop: &[usize]) -> StoreResult<Vec<u8>> {
        let volume = self.volume(uuid, name)?;
        let shape = &volume.metadata.shape;
        check_rank(start, stop, shape.len())?;
        for axis in 0..shape.len() {
            if start[axis] >= stop[axis] || stop[axis] > shape[axis] {
                return Err(StoreError::BadRegion(format!(
                    "read range [{}, {}) is invalid on axis {} of extent {}",
                    start[axis], stop[axis], axis, shape[axis]
                )));
            }
        }

        let mut view = volume.data.view();
        for (axis, (&a, &b)) in start.iter().zip(stop).enumerate() {
            view.slice_axis_inplace(Axis(axis + 1), Slice::new(a as isize, Some(b as isize), 1));
        }
        // Column-major walk over [esize, region...] is the wire encoding.
        Ok(view.t().iter().copied().collect())
    }

    /// Write wire-encoded bytes into `[start, stop)`, growing the
    /// volume first if `stop` exceeds its current extents.
    ///
    /// All validation happens before any mutation; a failed write
    /// leaves the volume untouched.
    pub fn write_region(
        &mut self,
        uuid: &str,
        name: &str,
        start: &[usize],
        stop: &[usize],
        bytes: &[u8],
    ) -> StoreResult<()> {
        let volume = self.volume_mut(uuid, name)?;
        let shape = volume.metadata.shape.clone();
        check_rank(start, stop, shape.len())?;
        for axis in 0..shape.len() {
            if start[axis] >= stop[axis] {
                return Err(StoreError::BadRegion(format!(
                    "write range [{}, {}) is empty on axis {}",
                    start[axis], stop[axis], axis
                )));
            }
        }

        let element_size = volume.metadata.dtype.size_in_bytes();
        let region_shape: Vec<usize> = start.iter().zip(stop).map(|(&a, &b)| b - a).collect();
        let expected = region_shape.iter().product::<usize>() * element_size;
        if bytes.len() != expected {
            return Err(StoreError::BadRegion(format!(
                "payload has {} bytes but the region requires {}",
                bytes.len(),
                expected
            )));
        }

        if stop.iter().zip(&shape).any(|(&b, &s)| b > s) {
            grow(volume, stop);
        }

        // Re-wrap the incoming bytes with the byte axis in front; the
        // fortran walk then lines element bytes up with the store's own
        // layout.
        let mut incoming_shape = Vec::with_capacity(1 + region_shape.len());
        incoming_shape.push(element_size);
        incoming_shape.extend_from_slice(&region_shape);
        let incoming = ArrayD::from_shape_vec(IxDyn(&incoming_shape).f(), bytes.to_vec())
            .expect("payload length was checked against the region shape");

        restrict(volume.data.view_mut(), start, stop).assign(&incoming);
        Ok(())
    }

    fn volume(&self, uuid: &str, name: &str) -> StoreResult<&Volume> {
        self.nodes
            .get(uuid)
            .ok_or_else(|| StoreError::UnknownNode(uuid.to_string()))?
            .get(name)
            .ok_or_else(|| StoreError::UnknownVolume(uuid.to_string(), name.to_string()))
    }

    fn volume_mut(&mut self, uuid: &str, name: &str) -> StoreResult<&mut Volume> {
        self.nodes
            .get_mut(uuid)
            .ok_or_else(|| StoreError::UnknownNode(uuid.to_string()))?
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownVolume(uuid.to_string(), name.to_string()))
    }
}

fn check_rank(start: &[usize], stop: &[usize], rank: usize) -> StoreResult<()> {
    if start.len() != rank || stop.len() != rank {
        return Err(StoreError::BadRegion(format!(
            "start/stop have {}/{} axes but the volume has {}",
            start.len(),
            stop.len(),
            rank
        )));
    }
    Ok(())
}

/// Grow `volume` so that `stop` fits, zero-filling the new space and
/// replacing the metadata with the new extents.
fn grow(volume: &mut Volume, stop: &[usize]) {
    let old_shape = volume.metadata.shape.clone();
    let new_shape: Vec<usize> = old_shape
        .iter()
        .zip(stop)
        .map(|(&current, &wanted)| current.max(wanted))
        .collect();

    let grown_metadata = volume.metadata.with_shape(new_shape);
    let mut grown = ArrayD::<u8>::zeros(full_shape(&grown_metadata).f());
    if old_shape.iter().all(|&extent| extent > 0) {
        let zeros = vec![0; old_shape.len()];
        restrict(grown.view_mut(), &zeros, &old_shape).assign(&volume.data);
    }
    volume.metadata = grown_metadata;
    volume.data = grown;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::DataType;

    fn seeded_store() -> VolumeStore {
        let mut store = VolumeStore::new();
        store.add_node("abcde");
        let metadata =
            VolumeMetadata::create_default(&[2, 4, 5], DataType::U16, "cxy", 1.0, "").unwrap();
        store.create_volume("abcde", "vol", metadata).unwrap();
        store
    }

    #[test]
    fn create_is_guarded() {
        let mut store = seeded_store();
        let metadata =
            VolumeMetadata::create_default(&[2, 4, 5], DataType::U16, "cxy", 1.0, "").unwrap();
        assert!(matches!(
            store.create_volume("nope", "vol", metadata.clone()),
            Err(StoreError::UnknownNode(_))
        ));
        assert!(matches!(
            store.create_volume("abcde", "vol", metadata),
            Err(StoreError::DuplicateVolume(_, _))
        ));
    }

    #[test]
    fn fresh_volume_reads_zero() {
        let store = seeded_store();
        let bytes = store
            .read_region("abcde", "vol", &[0, 0, 0], &[2, 4, 5])
            .unwrap();
        assert_eq!(bytes.len(), 2 * 4 * 5 * 2);
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn write_then_read_roundtrip() {
        let mut store = seeded_store();
        // Region (2, 2, 3) of u16: 24 bytes.
        let payload: Vec<u8> = (0u8..24).collect();
        store
            .write_region("abcde", "vol", &[0, 1, 1], &[2, 3, 4], &payload)
            .unwrap();
        let bytes = store
            .read_region("abcde", "vol", &[0, 1, 1], &[2, 3, 4])
            .unwrap();
        assert_eq!(bytes, payload);

        // A disjoint region is still zero.
        let elsewhere = store
            .read_region("abcde", "vol", &[0, 0, 0], &[2, 1, 1])
            .unwrap();
        assert!(elsewhere.iter().all(|&b| b == 0));
    }

    #[test]
    fn wrong_payload_size_is_rejected_without_mutation() {
        let mut store = seeded_store();
        let err = store
            .write_region("abcde", "vol", &[0, 0, 0], &[2, 2, 2], &[1, 2, 3])
            .unwrap_err();
        assert!(matches!(err, StoreError::BadRegion(_)));
        let bytes = store
            .read_region("abcde", "vol", &[0, 0, 0], &[2, 4, 5])
            .unwrap();
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn out_of_bounds_read_is_rejected() {
        let store = seeded_store();
        assert!(matches!(
            store.read_region("abcde", "vol", &[0, 0, 0], &[2, 4, 6]),
            Err(StoreError::BadRegion(_))
        ));
    }

    #[test]
    fn oversized_write_grows_the_volume() {
        let mut store = seeded_store();
        // Mark a witness voxel in the original extents.
        let witness = vec![7u8; 2 * 2];
        store
            .write_region("abcde", "vol", &[0, 0, 0], &[2, 1, 1], &witness)
            .unwrap();

        // Write past the end of both spatial axes.
        let region_len = 2 * 2 * 3 * 2; // (c, x, y) = (2, 2, 3), u16
        store
            .write_region(
                "abcde",
                "vol",
                &[0, 4, 6],
                &[2, 6, 9],
                &vec![1u8; region_len],
            )
            .unwrap();

        let grown = store.metadata("abcde", "vol").unwrap();
        assert_eq!(grown.shape, vec![2, 6, 9]);

        // Old data survived the growth, new space is zero-filled.
        let kept = store
            .read_region("abcde", "vol", &[0, 0, 0], &[2, 1, 1])
            .unwrap();
        assert_eq!(kept, witness);
        let gap = store
            .read_region("abcde", "vol", &[0, 0, 5], &[2, 4, 6])
            .unwrap();
        assert!(gap.iter().all(|&b| b == 0));
    }

    #[test]
    fn zero_extent_volume_grows_on_first_write() {
        let mut store = VolumeStore::new();
        store.add_node("abcde");
        let metadata =
            VolumeMetadata::create_default(&[1, 0, 0], DataType::U8, "cxy", 1.0, "").unwrap();
        store.create_volume("abcde", "empty", metadata).unwrap();

        store
            .write_region("abcde", "empty", &[0, 0, 0], &[1, 2, 2], &[9, 9, 9, 9])
            .unwrap();
        assert_eq!(store.metadata("abcde", "empty").unwrap().shape, vec![1, 2, 2]);
        assert_eq!(
            store
                .read_region("abcde", "empty", &[0, 0, 0], &[1, 2, 2])
                .unwrap(),
            vec![9, 9, 9, 9]
        );
    }
}
