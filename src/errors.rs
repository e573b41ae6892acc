//! Error taxonomy for the voxelgate client and reference server.
//!
//! The split mirrors the protocol design: anything the caller got wrong
//! is rejected before a single byte hits the wire (`Slicing`,
//! `TypeMismatch`, `UnsupportedType`), anything the server got wrong
//! surfaces with full request/response diagnostics (`Http`,
//! `UnexpectedResponse`), and the busy-retry loop has its own terminal
//! error (`RetryTimeout`).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The server returned a non-success status code to a request.
    ///
    /// Carries everything needed to reconstruct what went wrong without
    /// re-running the request.
    #[error(
        "while attempting \"{action}\" the server returned an error: {status} \"{reason}\"\n\
         request method: {method}\n\
         request path: {path}\n\
         request body: {request_body}\n\
         response body from server was:\n{response_body}"
    )]
    Http {
        action: String,
        method: &'static str,
        path: String,
        status: u16,
        reason: String,
        response_body: String,
        request_body: String,
    },

    /// The server did not return an HTTP error, but the response
    /// nonetheless violates a protocol expectation (leftover bytes,
    /// truncated payload, unparseable success body).
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// The caller-supplied index expression violates the volume's
    /// shape, channel, or step constraints.
    #[error("bad slicing: {0}")]
    Slicing(String),

    /// The busy-retry budget was exhausted without a non-busy response.
    #[error(
        "server is still busy after {attempts} attempts over {elapsed_secs:.1} seconds"
    )]
    RetryTimeout { attempts: u32, elapsed_secs: f64 },

    /// Metadata JSON was missing required fields or internally
    /// inconsistent.
    #[error("malformed volume metadata: {0}")]
    MalformedMetadata(String),

    /// No storage typename exists for this dtype/channel-count pair.
    #[error("no storage typename for {channels} channel(s) of element type {dtype}")]
    UnsupportedType { dtype: &'static str, channels: usize },

    /// The accessor's compile-time element type disagrees with the
    /// remote volume's dtype.
    #[error("volume has element type {expected}, but access was requested as {requested}")]
    TypeMismatch {
        expected: &'static str,
        requested: &'static str,
    },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
