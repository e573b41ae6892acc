//! Http client for reading and writing a remote voxel volume.
//!
//! A [`VoxelsAccessor`] is bound to one volume on one server and is
//! typed by the volume's element type; the binding is checked against
//! the remote metadata before any cutout I/O happens.  Reads and writes
//! go through the busy-retry loop, and writes that grow the remote
//! volume refresh the cached metadata so `shape()` stays truthful.

use std::marker::PhantomData;
use std::sync::Arc;

use ndarray::{ArrayD, IxDyn};

use crate::client::{get_json, ConnectionPool};
use crate::codec::{self, Element};
use crate::errors::{Error, Result};
use crate::metadata::{DataType, VolumeMetadata};
use crate::retry::RetryPolicy;
use crate::slicing::{self, AxisSelect, DimSlice};

/// Per-accessor knobs.
#[derive(Debug, Clone, Default)]
pub struct AccessorOptions {
    pub retry: RetryPolicy,
    /// Ask the server to apply its own load shedding to cutout
    /// requests (adds `throttle=on` to the query string).
    pub throttle: bool,
    /// Extra query args appended to every cutout request, after the `?`.
    pub query_args: Vec<(String, String)>,
}

/// Fetch the opaque server-info JSON.
pub fn get_server_info(pool: &ConnectionPool) -> Result<serde_json::Value> {
    get_json(pool, "/api/server/info")
}

/// Query the metadata for one volume.
pub fn get_metadata(pool: &ConnectionPool, uuid: &str, data_name: &str) -> Result<VolumeMetadata> {
    let path = format!("/api/node/{}/{}/metadata", uuid, data_name);
    let response = pool
        .get(&path)?
        .check_status("metadata query", "GET", &path, "")?;
    VolumeMetadata::from_json(&response.read_text()?)
}

/// Create a new volume on the server.
///
/// The storage typename in the URL is derived from the metadata, so
/// this fails client-side with [`Error::UnsupportedType`] for
/// dtype/channel combinations the protocol has no tag for.
pub fn create_new(
    pool: &ConnectionPool,
    uuid: &str,
    data_name: &str,
    metadata: &VolumeMetadata,
) -> Result<()> {
    let typename = metadata.storage_typename()?;
    let path = format!("/api/dataset/{}/new/{}/{}", uuid, typename, data_name);
    let body = metadata.to_json();
    let response = pool
        .post(&path, "text/json", body.clone().into_bytes())?
        .check_status("voxels.new", "POST", &path, &body)?;
    let leftover = response.read_text()?;
    if !leftover.is_empty() {
        return Err(Error::UnexpectedResponse(format!(
            "expected an empty response to volume creation, got: {}",
            leftover
        )));
    }
    Ok(())
}

/// Typed client for one remote voxel volume.
pub struct VoxelsAccessor<T: Element> {
    pool: Arc<ConnectionPool>,
    uuid: String,
    data_name: String,
    metadata: VolumeMetadata,
    options: AccessorOptions,
    _element: PhantomData<T>,
}

impl<T: Element> VoxelsAccessor<T> {
    /// Bind to a volume, querying the server for its metadata.
    pub fn open(
        pool: Arc<ConnectionPool>,
        uuid: &str,
        data_name: &str,
        options: AccessorOptions,
    ) -> Result<VoxelsAccessor<T>> {
        let metadata = get_metadata(&pool, uuid, data_name)?;
        VoxelsAccessor::with_metadata(pool, uuid, data_name, metadata, options)
    }

    /// Bind with pre-fetched metadata (no network traffic).
    pub fn with_metadata(
        pool: Arc<ConnectionPool>,
        uuid: &str,
        data_name: &str,
        metadata: VolumeMetadata,
        options: AccessorOptions,
    ) -> Result<VoxelsAccessor<T>> {
        if metadata.dtype != T::DTYPE {
            return Err(Error::TypeMismatch {
                expected: metadata.dtype.wire_name(),
                requested: T::DTYPE.wire_name(),
            });
        }
        Ok(VoxelsAccessor {
            pool,
            uuid: uuid.to_string(),
            data_name: data_name.to_string(),
            metadata,
            options,
            _element: PhantomData,
        })
    }

    /// The volume's current extents (channel axis first).  Refreshed
    /// automatically after a write that grows the volume.
    pub fn shape(&self) -> &[usize] {
        &self.metadata.shape
    }

    pub fn axiskeys(&self) -> &str {
        &self.metadata.axiskeys
    }

    pub fn dtype(&self) -> DataType {
        self.metadata.dtype
    }

    pub fn metadata(&self) -> &VolumeMetadata {
        &self.metadata
    }

    /// Request the subvolume `[start, stop)`, all axes explicit, all
    /// channels included.
    pub fn get_region(&self, start: &[usize], stop: &[usize]) -> Result<ArrayD<T>> {
        self.ensure_full_channels(start, stop)?;
        slicing::validate_read_roi(start, stop, &self.metadata.shape)?;
        self.options
            .retry
            .run("subvolume query", || self.fetch_region(start, stop))
    }

    /// Overwrite the subvolume `[start, stop)` with `data`.
    ///
    /// `stop` may exceed the current extents; the server grows the
    /// volume, and the accessor re-queries metadata afterwards so the
    /// new shape is visible.
    pub fn put_region(&mut self, start: &[usize], stop: &[usize], data: &ArrayD<T>) -> Result<()> {
        slicing::validate_write_roi(start, stop, &self.metadata.shape)?;
        let roi_len: usize = start
            .iter()
            .zip(stop)
            .map(|(&a, &b)| b - a)
            .product();
        if data.len() != roi_len {
            return Err(Error::Slicing(format!(
                "provided data does not match the shape of the write: data has {} elements, \
                 the region [{:?}, {:?}) has {}",
                data.len(),
                start,
                stop,
                roi_len
            )));
        }

        self.options
            .retry
            .run("subvolume post", || self.push_region(start, stop, data))?;

        if stop.iter().zip(&self.metadata.shape).any(|(&b, &s)| b > s) {
            // The post updated the volume's extents; pick up the new shape.
            self.metadata = get_metadata(&self.pool, &self.uuid, &self.data_name)?;
        }
        Ok(())
    }

    /// Read with a numpy-style index expression.
    ///
    /// Fixed indices squeeze their axis from the result; steps are
    /// applied client-side after the dense read; slicing into the
    /// channel axis is allowed, but the full channel range is fetched
    /// and trimmed locally, so prefer one full read over one read per
    /// channel.
    pub fn get(&self, expr: &[DimSlice]) -> Result<ArrayD<T>> {
        let slicing = slicing::translate(expr, &self.metadata.shape)?;
        if slicing.request.is_empty() {
            // Zero-rank volume: an empty result, no request made.
            return Ok(empty_array());
        }
        if let AxisSelect::Index(channel) = slicing.result[0] {
            if channel >= self.metadata.num_channels() {
                return Err(Error::Slicing(format!(
                    "channel index {} is out of range for {} channel(s)",
                    channel,
                    self.metadata.num_channels()
                )));
            }
        }
        let dense = self.get_region(&slicing.start(), &slicing.stop())?;
        Ok(slicing::apply_result(&dense, &slicing.result))
    }

    /// Write with a numpy-style index expression.
    ///
    /// Only dense writes are supported: every channel must be covered
    /// and no axis may use a step.  Both violations fail before any
    /// network call.
    pub fn set(&mut self, expr: &[DimSlice], data: &ArrayD<T>) -> Result<()> {
        let slicing = slicing::translate(expr, &self.metadata.shape)?;
        if slicing.request.is_empty() {
            return Err(Error::Slicing(
                "cannot write to a zero-extent volume".to_string(),
            ));
        }
        slicing::check_writable(&slicing, &self.metadata.shape)?;
        self.put_region(&slicing.start(), &slicing.stop(), data)
    }

    fn ensure_full_channels(&self, start: &[usize], stop: &[usize]) -> Result<()> {
        let channels = self.metadata.num_channels();
        if start.first() != Some(&0) || stop.first() != Some(&channels) {
            return Err(Error::Slicing(
                "subvolume get/post must include all channels".to_string(),
            ));
        }
        Ok(())
    }

    fn fetch_region(&self, start: &[usize], stop: &[usize]) -> Result<ArrayD<T>> {
        let path = self.cutout_path(start, stop);
        let mut response = self
            .pool
            .get(&path)?
            .check_status("subvolume query", "GET", &path, "")?;
        let full_shape: Vec<usize> = start.iter().zip(stop).map(|(&a, &b)| b - a).collect();
        let dense = codec::decode(&mut response, &full_shape)?;
        // NOTE: this final read is not optional; see codec::ensure_drained.
        codec::ensure_drained(&mut response)?;
        Ok(dense)
    }

    fn push_region(&self, start: &[usize], stop: &[usize], data: &ArrayD<T>) -> Result<()> {
        let path = self.cutout_path(start, stop);
        let mut body = Vec::with_capacity(codec::buffer_len::<T>(data.shape()));
        codec::encode(&mut body, data)?;
        let response = self
            .pool
            .post(&path, codec::VOLUME_MIMETYPE, body)?
            .check_status("subvolume post", "POST", &path, "<binary data>")?;
        // The connection is only reusable once the response is consumed.
        response.drain()
    }

    /// Build the REST path for a cutout get/post.  The channel axis is
    /// dropped: the wire addresses only the spatial axes, and payloads
    /// always carry every channel.
    fn cutout_path(&self, start: &[usize], stop: &[usize]) -> String {
        let offset = &start[1..];
        let extent: Vec<usize> = stop[1..]
            .iter()
            .zip(offset)
            .map(|(&b, &a)| b - a)
            .collect();

        let dims = join_underscored(0..offset.len());
        let extent_str = join_underscored(extent.iter());
        let offset_str = join_underscored(offset.iter());
        let mut path = format!(
            "/api/node/{}/{}/raw/{}/{}/{}",
            self.uuid, self.data_name, dims, extent_str, offset_str
        );

        let mut args = self.options.query_args.clone();
        if self.options.throttle && !args.iter().any(|(key, _)| key == "throttle") {
            args.push(("throttle".to_string(), "on".to_string()));
        }
        if !args.is_empty() {
            let query: Vec<String> = args
                .iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect();
            path.push('?');
            path.push_str(&query.join("&"));
        }
        path
    }
}

fn join_underscored<I: IntoIterator<Item = impl ToString>>(items: I) -> String {
    items
        .into_iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join("_")
}

fn empty_array<T: Element>() -> ArrayD<T> {
    ArrayD::from_shape_vec(IxDyn(&[0]), Vec::new()).expect("an empty array always builds")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{DataType, VolumeMetadata};

    fn test_accessor(throttle: bool) -> VoxelsAccessor<u8> {
        // Points at a host that is never contacted by these tests.
        let pool = Arc::new(ConnectionPool::new("localhost:1"));
        let metadata =
            VolumeMetadata::create_default(&[3, 100, 200, 400], DataType::U8, "cxyz", 1.0, "")
                .unwrap();
        VoxelsAccessor::with_metadata(
            pool,
            "abc123",
            "grayscale_vol",
            metadata,
            AccessorOptions {
                throttle,
                ..AccessorOptions::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn cutout_path_grammar() {
        let accessor = test_accessor(false);
        let path = accessor.cutout_path(&[0, 9, 5, 50], &[3, 10, 20, 150]);
        assert_eq!(path, "/api/node/abc123/grayscale_vol/raw/0_1_2/1_15_100/9_5_50");
    }

    #[test]
    fn cutout_path_with_query_args() {
        let mut accessor = test_accessor(true);
        accessor
            .options
            .query_args
            .push(("roi".to_string(), "some_ref".to_string()));
        let path = accessor.cutout_path(&[0, 0, 0, 0], &[3, 10, 20, 30]);
        assert_eq!(
            path,
            "/api/node/abc123/grayscale_vol/raw/0_1_2/10_20_30/0_0_0?roi=some_ref&throttle=on"
        );
    }

    #[test]
    fn dtype_mismatch_is_rejected_before_any_io() {
        let pool = Arc::new(ConnectionPool::new("localhost:1"));
        let metadata =
            VolumeMetadata::create_default(&[1, 10, 10], DataType::U32, "cxy", 1.0, "").unwrap();
        let err = VoxelsAccessor::<u8>::with_metadata(
            pool,
            "abc123",
            "labels",
            metadata,
            AccessorOptions::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            Error::TypeMismatch { expected: "uint32", requested: "uint8" }
        ));
    }

    #[test]
    fn invalid_expressions_fail_before_any_io() {
        let mut accessor = test_accessor(false);

        // Stepped write.
        let data = ArrayD::from_elem(IxDyn(&[3, 5, 200, 400]), 1u8);
        let err = accessor
            .set(
                &[DimSlice::full(), DimSlice::stepped(0, 10, 2)],
                &data,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Slicing(_)));

        // Partial-channel write.
        let err = accessor
            .set(&[DimSlice::span(0, 2)], &data)
            .unwrap_err();
        assert!(matches!(err, Error::Slicing(_)));

        // Read past the end of an axis.
        let err = accessor
            .get(&[DimSlice::full(), DimSlice::span(0, 11)])
            .unwrap_err();
        assert!(matches!(err, Error::Slicing(_)));

        // Channel index out of range.
        let err = accessor.get(&[DimSlice::idx(3)]).unwrap_err();
        assert!(matches!(err, Error::Slicing(_)));
    }

    #[test]
    fn zero_rank_volume_reads_empty_without_network() {
        let pool = Arc::new(ConnectionPool::new("localhost:1"));
        let metadata = VolumeMetadata {
            shape: vec![],
            dtype: DataType::U8,
            axiskeys: String::new(),
            axes: vec![],
            channel_labels: vec![],
        };
        let accessor: VoxelsAccessor<u8> =
            VoxelsAccessor::with_metadata(pool, "abc123", "nothing", metadata, Default::default())
                .unwrap();
        let result = accessor.get(&[DimSlice::Ellipsis]).unwrap();
        assert_eq!(result.len(), 0);
    }
}
