//! Blocking HTTP transport for the voxel protocol.
//!
//! One physical connection cannot have two request/response cycles in
//! flight at once; interleaving them corrupts the byte stream, which is
//! a protocol violation rather than a performance problem.  The pool
//! therefore hands every calling thread its own lazily-created
//! connection (creation is guarded by the pool lock), and each
//! connection carries a gate mutex that is held from the moment a
//! request is sent until its response body has been fully consumed.
//! The gate's guard travels inside the returned [`WireResponse`], so
//! dropping the response is what releases the connection.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::RawMutex;
use reqwest::header::CONTENT_TYPE;

use crate::errors::{Error, Result};

type Gate = Arc<parking_lot::Mutex<()>>;
type GateGuard = ArcMutexGuard<RawMutex, ()>;

struct Connection {
    client: reqwest::blocking::Client,
    gate: Gate,
}

/// A pool of blocking HTTP connections to one server, keyed by calling
/// thread.
pub struct ConnectionPool {
    hostname: String,
    timeout: Option<Duration>,
    connections: Mutex<HashMap<ThreadId, Arc<Connection>>>,
}

impl ConnectionPool {
    /// Connect to `hostname`, e.g. `"localhost:8000"`.
    pub fn new(hostname: impl Into<String>) -> ConnectionPool {
        ConnectionPool {
            hostname: hostname.into(),
            timeout: None,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Connect with a connect/read timeout on the transport.  This is
    /// independent of the retry loop's own timeout accounting.
    pub fn with_timeout(hostname: impl Into<String>, timeout: Duration) -> ConnectionPool {
        ConnectionPool {
            hostname: hostname.into(),
            timeout: Some(timeout),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Connect to the host named by `VOXELGATE_HOST` (with the timeout
    /// from `VOXELGATE_TIMEOUT_SECS`, if set).
    pub fn from_env() -> ConnectionPool {
        ConnectionPool {
            hostname: crate::config::get_host(),
            timeout: crate::config::get_timeout(),
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Get or create the connection owned by the current thread.
    fn connection(&self) -> Result<Arc<Connection>> {
        let thread_id = thread::current().id();
        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(connection) = connections.get(&thread_id) {
            return Ok(connection.clone());
        }

        let mut builder = reqwest::blocking::Client::builder().pool_max_idle_per_host(1);
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout).connect_timeout(timeout);
        }
        let connection = Arc::new(Connection {
            client: builder.build()?,
            gate: Arc::new(parking_lot::Mutex::new(())),
        });
        connections.insert(thread_id, connection.clone());
        Ok(connection)
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.hostname, path)
    }

    /// Issue a GET for `path` (which may carry a query string).
    pub fn get(&self, path: &str) -> Result<WireResponse> {
        let connection = self.connection()?;
        let guard = connection.gate.lock_arc();
        let response = connection.client.get(self.url(path)).send()?;
        Ok(WireResponse::new(response, guard))
    }

    /// Issue a POST with the given body.
    pub fn post(&self, path: &str, content_type: &str, body: Vec<u8>) -> Result<WireResponse> {
        let connection = self.connection()?;
        let guard = connection.gate.lock_arc();
        let response = connection
            .client
            .post(self.url(path))
            .header(CONTENT_TYPE, content_type)
            .body(body)
            .send()?;
        Ok(WireResponse::new(response, guard))
    }

    /// Drop all pooled connections, for every thread.
    pub fn close(&self) {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// A response whose body is still streaming from the server.
///
/// Holds its connection's gate until dropped; read the body to the end
/// (or drop the response) before issuing another request from the same
/// thread.
pub struct WireResponse {
    status: u16,
    reason: String,
    body: reqwest::blocking::Response,
    _gate: GateGuard,
}

impl WireResponse {
    fn new(response: reqwest::blocking::Response, gate: GateGuard) -> WireResponse {
        let status = response.status();
        WireResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("").to_string(),
            body: response,
            _gate: gate,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// 200 and 204 are both success-with-possibly-empty-body.
    pub fn is_success(&self) -> bool {
        matches!(self.status, 200 | 204)
    }

    /// Read the remaining body as text.
    pub fn read_text(mut self) -> Result<String> {
        let mut text = String::new();
        self.body.read_to_string(&mut text)?;
        Ok(text)
    }

    /// Read the remaining body and throw it away.  The connection is
    /// not reusable until the previous response has been fully read.
    pub fn drain(mut self) -> Result<()> {
        let mut sink = Vec::new();
        self.body.read_to_end(&mut sink)?;
        Ok(())
    }

    /// Turn a non-success status into an [`Error::Http`] carrying full
    /// request/response diagnostics; pass successes through.
    pub fn check_status(
        self,
        action: &str,
        method: &'static str,
        path: &str,
        request_body: &str,
    ) -> Result<WireResponse> {
        if self.is_success() {
            return Ok(self);
        }
        let status = self.status;
        let reason = self.reason.clone();
        let response_body = self.read_text().unwrap_or_default();
        Err(Error::Http {
            action: action.to_string(),
            method,
            path: path.to_string(),
            status,
            reason,
            response_body,
            request_body: request_body.to_string(),
        })
    }
}

impl Read for WireResponse {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.body.read(buf)
    }
}

/// GET a path and parse the response as JSON.
pub fn get_json(pool: &ConnectionPool, path: &str) -> Result<serde_json::Value> {
    let response = pool.get(path)?.check_status(
        &format!("requesting json for: {}", path),
        "GET",
        path,
        "",
    )?;
    let text = response.read_text()?;
    serde_json::from_str(&text).map_err(|e| {
        Error::UnexpectedResponse(format!("could not parse the response as json: {}", e))
    })
}
