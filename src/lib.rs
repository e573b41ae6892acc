//! voxelgate: a client/server pair for moving dense N-dimensional voxel
//! cutouts over HTTP.
//!
//! The client side is a typed [`VoxelsAccessor`] with numpy-style
//! slicing, transparent busy-retry, and a thread-keyed connection pool.
//! The server side (see [`server`] and the `voxelgate` binary) is a
//! reference implementation backed by an in-memory dense-array store.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ndarray::{ArrayD, IxDyn};
//! use voxelgate::{accessor, AccessorOptions, ConnectionPool, DataType, DimSlice,
//!                 VolumeMetadata, VoxelsAccessor};
//!
//! # fn main() -> voxelgate::Result<()> {
//! // Reads VOXELGATE_HOST, default "localhost:8000".
//! let pool = Arc::new(ConnectionPool::from_env());
//!
//! // Create a new remote volume (shapes always lead with the channel axis).
//! let metadata =
//!     VolumeMetadata::create_default(&[1, 100, 200, 400], DataType::U8, "cxyz", 1.0, "nm")?;
//! accessor::create_new(&pool, "abc123", "my_volume", &metadata)?;
//!
//! // Write a dense block, then read a stepped, channel-squeezed view of it.
//! let mut volume: VoxelsAccessor<u8> =
//!     VoxelsAccessor::open(pool, "abc123", "my_volume", AccessorOptions::default())?;
//! let block = ArrayD::from_elem(IxDyn(&[1, 10, 10, 10]), 7u8);
//! volume.set(
//!     &[DimSlice::full(), DimSlice::span(0, 10), DimSlice::span(0, 10), DimSlice::span(0, 10)],
//!     &block,
//! )?;
//! let tile = volume.get(&[DimSlice::idx(0), DimSlice::Ellipsis, DimSlice::stepped(0, 10, 2)])?;
//! assert_eq!(tile.shape(), &[100, 200, 5]);
//! # Ok(())
//! # }
//! ```

pub mod accessor;
pub mod client;
pub mod codec;
pub mod config;
pub mod errors;
pub mod metadata;
pub mod retry;
pub mod server;
pub mod slicing;
pub mod store;

pub use accessor::{create_new, get_metadata, get_server_info, AccessorOptions, VoxelsAccessor};
pub use client::ConnectionPool;
pub use errors::{Error, Result};
pub use metadata::{DataType, VolumeMetadata};
pub use retry::RetryPolicy;
pub use slicing::DimSlice;
