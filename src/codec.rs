//! Encoding and decoding of dense subvolume payloads.
//!
//! The wire format is brutally simple: raw little-endian element bytes
//! in column-major (fortran) order over the transferred shape, channel
//! axis included, no header, no padding.  Both directions move data in
//! fixed-size chunks so a large cutout never needs a second full-size
//! temporary beyond the destination buffer itself.

use std::io::{self, Read, Write};

use ndarray::{ArrayD, ArrayViewD, IxDyn, ShapeBuilder};

use crate::errors::{Error, Result};
use crate::metadata::DataType;

/// Data is sent to/retrieved from the stream in chunks of this size.
pub const STREAM_CHUNK_SIZE: usize = 1000; // bytes

/// Content type of an encoded subvolume.
pub const VOLUME_MIMETYPE: &str = "application/octet-stream";

/// A voxel element type that can travel over the wire.
///
/// `Pod` gives us safe byte-level casting in both directions; `DTYPE`
/// ties the compile-time type to the metadata tag so an accessor can be
/// checked against its remote volume before any I/O happens.
pub trait Element: bytemuck::Pod + PartialEq + std::fmt::Debug + Send + Sync + 'static {
    const DTYPE: DataType;
}

impl Element for u8 {
    const DTYPE: DataType = DataType::U8;
}
impl Element for u16 {
    const DTYPE: DataType = DataType::U16;
}
impl Element for u32 {
    const DTYPE: DataType = DataType::U32;
}
impl Element for u64 {
    const DTYPE: DataType = DataType::U64;
}
impl Element for f32 {
    const DTYPE: DataType = DataType::F32;
}
impl Element for f64 {
    const DTYPE: DataType = DataType::F64;
}

/// Number of payload bytes for a cutout of the given shape.
pub fn buffer_len<T: Element>(shape: &[usize]) -> usize {
    shape.iter().product::<usize>() * std::mem::size_of::<T>()
}

/// True if the array's memory is already fortran-contiguous.
pub(crate) fn is_fortran<T>(array: &ArrayViewD<'_, T>) -> bool {
    array.t().is_standard_layout()
}

/// Copy an arbitrary view into a fresh fortran-contiguous array.
pub(crate) fn to_fortran<T: Element>(view: ArrayViewD<'_, T>) -> ArrayD<T> {
    let shape = view.shape().to_vec();
    // Iterating the transposed view walks the original in column-major
    // order, which is exactly the order from_shape_vec(.f()) expects.
    let elements: Vec<T> = view.t().iter().copied().collect();
    ArrayD::from_shape_vec(IxDyn(&shape).f(), elements)
        .expect("element count matches the view's own shape")
}

/// Encode `array` to `stream`.
///
/// If the array's memory is not already column-major contiguous it is
/// copied into a column-major buffer first; the wire format requires
/// contiguous column-major bytes, so the copy is mandatory, not an
/// optimization.
pub fn encode<W: Write, T: Element>(stream: &mut W, array: &ArrayD<T>) -> Result<()> {
    let fortran_copy;
    let view = if is_fortran(&array.view()) {
        array.view()
    } else {
        fortran_copy = to_fortran(array.view());
        fortran_copy.view()
    };
    let elements = view
        .as_slice_memory_order()
        .expect("fortran-contiguous array always has a memory-order slice");
    let bytes: &[u8] = bytemuck::cast_slice(elements);

    for chunk in bytes.chunks(STREAM_CHUNK_SIZE) {
        stream.write_all(chunk)?;
    }
    Ok(())
}

/// Decode a column-major array of the given shape from `stream`.
///
/// Reads exactly `buffer_len::<T>(shape)` bytes, in chunks.  A stream
/// that ends early is an [`Error::UnexpectedResponse`].  This function
/// does NOT verify that the stream is exhausted afterwards; response
/// streams must additionally be passed to [`ensure_drained`].
pub fn decode<R: Read, T: Element>(stream: &mut R, shape: &[usize]) -> Result<ArrayD<T>> {
    let expected = buffer_len::<T>(shape);
    let mut buf = vec![0u8; expected];
    let mut filled = 0;
    while filled < expected {
        let stop = (filled + STREAM_CHUNK_SIZE).min(expected);
        stream.read_exact(&mut buf[filled..stop]).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::UnexpectedResponse(format!(
                    "payload ended early: expected {} bytes total",
                    expected
                ))
            } else {
                Error::Io(e)
            }
        })?;
        filled = stop;
    }

    let elements: Vec<T> = bytemuck::pod_collect_to_vec(&buf);
    Ok(ArrayD::from_shape_vec(IxDyn(shape).f(), elements)
        .expect("buffer length was computed from this shape"))
}

/// The mandatory post-decode drain check.
///
/// After a payload has been decoded, the response stream must be read
/// once more; any residue means the server sent more bytes than the
/// shape declared.  Some HTTP client stacks also get upset when a
/// response is not read past its end, so the drain doubles as that
/// final read; the non-empty-residue check is the load-bearing part.
pub fn ensure_drained<R: Read>(stream: &mut R) -> Result<()> {
    let mut excess = Vec::new();
    stream.read_to_end(&mut excess)?;
    if !excess.is_empty() {
        return Err(Error::UnexpectedResponse(format!(
            "received data was longer than expected by {} bytes",
            excess.len()
        )));
    }
    Ok(())
}
