//! The reference range server.
//!
//! Incoming paths are matched against an ordered table of segment
//! patterns; the first entry that matches wins, so the table's order is
//! precedence-significant (fixed paths are listed before parametric
//! patterns that could shadow them).  A path matching no entry is a
//! `400`; a matched entry without the request's method is a `405`.
//! Rocket only hosts the HTTP layer: two catch-all routes feed every
//! request into the table, so the dispatch semantics live here and not
//! in the framework's router.
//!
//! Requests are processed to completion one at a time against the
//! shared store (it sits behind a mutex), so a write is fully applied
//! before the next request is dispatched.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use rocket::data::{Data, ToByteUnit};
use rocket::http::{ContentType, Status};
use rocket::{catch, catchers, get, post, routes, Build, Request, Rocket, State};

use crate::metadata::VolumeMetadata;
use crate::store::{StoreError, VolumeStore};

/// Shared server state: the dense-array store.
pub struct ServerState {
    pub store: Mutex<VolumeStore>,
}

impl ServerState {
    pub fn new(store: VolumeStore) -> ServerState {
        ServerState {
            store: Mutex::new(store),
        }
    }
}

pub type ApiResponse = (Status, (ContentType, Vec<u8>));

/// An error a handler wants turned into a plain-text status response.
struct RequestError {
    status: Status,
    message: String,
}

impl RequestError {
    fn new(status: Status, message: impl Into<String>) -> RequestError {
        RequestError {
            status,
            message: message.into(),
        }
    }
}

type HandlerResult = std::result::Result<ApiResponse, RequestError>;
type Handler = fn(&ServerState, &[&str], &[u8]) -> HandlerResult;

/// One segment of a path pattern.
enum Seg {
    Lit(&'static str),
    Param,
}

use Seg::{Lit, Param};

struct Route {
    pattern: &'static [Seg],
    get: Option<Handler>,
    post: Option<Handler>,
}

/// The dispatch table.  Evaluated top to bottom, first match wins;
/// keep fixed paths above parametric ones.
static ROUTES: &[Route] = &[
    Route {
        pattern: &[Lit("api"), Lit("server"), Lit("info")],
        get: Some(server_info),
        post: None,
    },
    Route {
        pattern: &[Lit("api"), Lit("dataset"), Param, Lit("new"), Param, Param],
        get: None,
        post: Some(create_volume),
    },
    Route {
        pattern: &[Lit("api"), Lit("node"), Param, Param, Lit("metadata")],
        get: Some(volume_metadata),
        post: None,
    },
    Route {
        pattern: &[
            Lit("api"),
            Lit("node"),
            Param,
            Param,
            Lit("raw"),
            Param,
            Param,
            Param,
        ],
        get: Some(cutout_read),
        post: Some(cutout_write),
    },
];

fn match_pattern<'a>(pattern: &[Seg], segments: &[&'a str]) -> Option<Vec<&'a str>> {
    if pattern.len() != segments.len() {
        return None;
    }
    let mut params = Vec::new();
    for (expected, &actual) in pattern.iter().zip(segments) {
        match expected {
            Lit(literal) => {
                if *literal != actual {
                    return None;
                }
            }
            Param => params.push(actual),
        }
    }
    Some(params)
}

/// Route one request through the table.
///
/// Query strings are accepted and ignored; the protocol's optional
/// query args (`throttle=on` and friends) do not change dispatch.
pub fn dispatch(state: &ServerState, method: &str, path: &str, body: &[u8]) -> ApiResponse {
    let bare = path.split('?').next().unwrap_or(path);
    let segments: Vec<&str> = bare.trim_start_matches('/').split('/').collect();

    for route in ROUTES {
        if let Some(params) = match_pattern(route.pattern, &segments) {
            let handler = match method {
                "GET" => route.get,
                "POST" => route.post,
                _ => None,
            };
            return match handler {
                Some(handler) => handler(state, &params, body)
                    .unwrap_or_else(|e| error_response(e.status, e.message)),
                None => error_response(
                    Status::MethodNotAllowed,
                    format!("unsupported method for query: {} {}", method, path),
                ),
            };
        }
    }
    error_response(Status::BadRequest, format!("bad query syntax: {}", path))
}

fn error_response(status: Status, message: String) -> ApiResponse {
    (status, (ContentType::Plain, message.into_bytes()))
}

fn text_json() -> ContentType {
    ContentType::new("text", "json")
}

fn octet_stream() -> ContentType {
    ContentType::new("application", "octet-stream")
}

fn no_content() -> ApiResponse {
    (Status::NoContent, (ContentType::Plain, Vec::new()))
}

fn store_error(err: StoreError) -> RequestError {
    let status = match err {
        StoreError::UnknownNode(_) | StoreError::UnknownVolume(_, _) => Status::NotFound,
        StoreError::DuplicateVolume(_, _) => Status::Conflict,
        StoreError::BadRegion(_) => Status::BadRequest,
    };
    RequestError::new(status, err.to_string())
}

fn lock_store(state: &ServerState) -> std::sync::MutexGuard<'_, VolumeStore> {
    state.store.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------

fn server_info(_state: &ServerState, _params: &[&str], _body: &[u8]) -> HandlerResult {
    let info = serde_json::json!({
        "Server": "voxelgate",
        "Version": env!("CARGO_PKG_VERSION"),
        "Datastore": "in-memory dense arrays",
        "Mode": "reference",
    });
    Ok((Status::Ok, (text_json(), info.to_string().into_bytes())))
}

fn volume_metadata(state: &ServerState, params: &[&str], _body: &[u8]) -> HandlerResult {
    let (uuid, name) = (params[0], params[1]);
    let store = lock_store(state);
    let metadata = store.metadata(uuid, name).map_err(store_error)?;
    Ok((Status::Ok, (text_json(), metadata.to_json().into_bytes())))
}

fn create_volume(state: &ServerState, params: &[&str], body: &[u8]) -> HandlerResult {
    let (uuid, typename, name) = (params[0], params[1], params[2]);

    let text = std::str::from_utf8(body).map_err(|_| {
        RequestError::new(
            Status::BadRequest,
            "creation parameters must be utf-8 json",
        )
    })?;
    let metadata = VolumeMetadata::from_json(text).map_err(|e| {
        RequestError::new(
            Status::BadRequest,
            format!("can't create volume; error parsing the volume description: {}", e),
        )
    })?;
    let implied = metadata.storage_typename().map_err(|e| {
        RequestError::new(Status::BadRequest, format!("can't create volume: {}", e))
    })?;
    if typename != implied {
        return Err(RequestError::new(
            Status::BadRequest,
            format!(
                "cannot create volume: the path typename was {} but the description implies {}",
                typename, implied
            ),
        ));
    }

    lock_store(state)
        .create_volume(uuid, name, metadata)
        .map_err(store_error)?;
    Ok(no_content())
}

/// The `[start, stop)` region (full rank, full channels) named by the
/// `<dims>/<shape>/<offset>` path segments, plus its payload size.
struct CutoutQuery {
    start: Vec<usize>,
    stop: Vec<usize>,
    expected_bytes: usize,
}

fn parse_cutout(
    metadata: &VolumeMetadata,
    dims: &str,
    extent_str: &str,
    offset_str: &str,
) -> std::result::Result<CutoutQuery, RequestError> {
    let spatial_rank = metadata.rank() - 1;

    let expected_dims: Vec<String> = (0..spatial_rank).map(|d| d.to_string()).collect();
    if dims != expected_dims.join("_") {
        return Err(RequestError::new(
            Status::BadRequest,
            format!(
                "queries must include all non-channel axes in ascending order; requested dims: {}",
                dims
            ),
        ));
    }

    let extent = parse_coords(extent_str, spatial_rank, "cutout shape")?;
    let offset = parse_coords(offset_str, spatial_rank, "cutout offset")?;

    let mut start = Vec::with_capacity(1 + spatial_rank);
    let mut stop = Vec::with_capacity(1 + spatial_rank);
    start.push(0);
    stop.push(metadata.num_channels());
    for (&at, &len) in offset.iter().zip(&extent) {
        start.push(at);
        stop.push(at + len);
    }

    let voxels: usize = start.iter().zip(&stop).map(|(&a, &b)| b - a).product();
    Ok(CutoutQuery {
        start,
        stop,
        expected_bytes: voxels * metadata.dtype.size_in_bytes(),
    })
}

fn parse_coords(
    text: &str,
    rank: usize,
    what: &str,
) -> std::result::Result<Vec<usize>, RequestError> {
    let parsed: std::result::Result<Vec<usize>, _> =
        text.split('_').map(str::parse::<usize>).collect();
    match parsed {
        Ok(coords) if coords.len() == rank => Ok(coords),
        Ok(coords) => Err(RequestError::new(
            Status::BadRequest,
            format!(
                "invalid {}: {} — expected {} axes, got {}",
                what,
                text,
                rank,
                coords.len()
            ),
        )),
        Err(_) => Err(RequestError::new(
            Status::BadRequest,
            format!("invalid {}: {}", what, text),
        )),
    }
}

fn cutout_read(state: &ServerState, params: &[&str], _body: &[u8]) -> HandlerResult {
    let (uuid, name) = (params[0], params[1]);
    let store = lock_store(state);
    let metadata = store.metadata(uuid, name).map_err(store_error)?.clone();
    let query = parse_cutout(&metadata, params[2], params[3], params[4])?;

    let bytes = store
        .read_region(uuid, name, &query.start, &query.stop)
        .map_err(store_error)?;
    // The body is sized, so Content-Length comes out byte-exact.
    Ok((Status::Ok, (octet_stream(), bytes)))
}

fn cutout_write(state: &ServerState, params: &[&str], body: &[u8]) -> HandlerResult {
    let (uuid, name) = (params[0], params[1]);
    let mut store = lock_store(state);
    let metadata = store.metadata(uuid, name).map_err(store_error)?.clone();
    let query = parse_cutout(&metadata, params[2], params[3], params[4])?;

    // Validate the payload in full before touching the store.
    if body.len() < query.expected_bytes {
        return Err(RequestError::new(
            Status::BadRequest,
            format!(
                "request body ended early: got {} of {} expected bytes",
                body.len(),
                query.expected_bytes
            ),
        ));
    }
    if body.len() > query.expected_bytes {
        return Err(RequestError::new(
            Status::BadRequest,
            format!(
                "request body was longer than expected by {} bytes",
                body.len() - query.expected_bytes
            ),
        ));
    }

    store
        .write_region(uuid, name, &query.start, &query.stop, body)
        .map_err(store_error)?;
    Ok(no_content())
}

// ---------------------------------------------------------------------
// Rocket hosting
// ---------------------------------------------------------------------

fn absolute(path: &Path) -> String {
    format!("/{}", path.to_string_lossy())
}

#[get("/<path..>")]
fn forward_get(path: PathBuf, state: &State<ServerState>) -> ApiResponse {
    dispatch(state.inner(), "GET", &absolute(&path), &[])
}

#[post("/<path..>", data = "<body>")]
async fn forward_post(path: PathBuf, body: Data<'_>, state: &State<ServerState>) -> ApiResponse {
    let bytes = match body.open(512.mebibytes()).into_bytes().await {
        Ok(capped) if capped.is_complete() => capped.into_inner(),
        Ok(_) => {
            return error_response(
                Status::BadRequest,
                "request body exceeds the transfer limit".to_string(),
            )
        }
        Err(e) => {
            return error_response(
                Status::InternalServerError,
                format!("failed to read the request body: {}", e),
            )
        }
    };
    dispatch(state.inner(), "POST", &absolute(&path), &bytes)
}

#[catch(404)]
fn not_found(req: &Request) -> String {
    format!("bad query syntax: {}", req.uri())
}

#[catch(500)]
fn server_fault(_req: &Request) -> String {
    "unexpected server fault while handling the request".to_string()
}

/// Assemble the server around a (usually pre-seeded) store.
pub fn rocket(store: VolumeStore) -> Rocket<Build> {
    rocket::build()
        .manage(ServerState::new(store))
        .mount("/", routes![forward_get, forward_post])
        .register("/", catchers![not_found, server_fault])
}
