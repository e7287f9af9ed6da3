//! Per-connection session.
//!
//! A session moves Connecting -> Bound -> Closed. The first frame must
//! be the `["SPREADSHEET", name]` handshake; everything else on a fresh
//! connection earns `"PROTOCOL ERROR"` and a hangup. Binding looks the
//! resource up with a retry budget (documents may still be loading),
//! then takes the resource's content lock for the whole bound phase.
//! Validation failures while bound are reported as `{"ERROR": msg}`
//! and the session stays alive.

use std::net::{Shutdown, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde_json::Value;

use gridserve_config::Settings;
use gridserve_core::{parse_reference, CellRange, RangeShape};
use gridserve_engine::{CellValue, EngineError};
use gridserve_protocol::{read_frame, write_frame, Received, Request, Response};

use crate::error::ServerError;
use crate::registry::{HolderId, Registry, Resource};

/// Everything a session needs beyond its socket.
pub struct SessionContext {
    pub registry: Arc<Registry>,
    pub save_dir: PathBuf,
    /// Lookup retries at one-second spacing before answering NOT FOUND.
    pub lookup_attempts: u64,
    pub idle_timeout: Duration,
    pub bind_timeout: Duration,
}

impl SessionContext {
    pub fn new(settings: &Settings, registry: Arc<Registry>) -> Self {
        Self {
            registry,
            save_dir: settings.save_dir.clone(),
            lookup_attempts: settings.poll_interval_secs + 1,
            idle_timeout: settings.idle_timeout(),
            bind_timeout: settings.bind_timeout(),
        }
    }
}

/// Drive one connection to completion. Consumes the stream; all exits
/// release the content lock and shut the socket down, tolerating a
/// peer that is already gone.
pub fn run_session(mut stream: TcpStream, conn_id: HolderId, ctx: &SessionContext) {
    if let Err(err) = stream.set_read_timeout(Some(ctx.idle_timeout)) {
        warn!("conn {}: cannot set read timeout: {}", conn_id, err);
        return;
    }

    if let Some(resource) = bind(&mut stream, conn_id, ctx) {
        serve(&mut stream, &resource, conn_id, ctx);
        resource.lock().release(conn_id);
    }

    let _ = stream.shutdown(Shutdown::Both);
    debug!("conn {}: closed", conn_id);
}

fn reply(stream: &mut TcpStream, response: Response) -> std::io::Result<()> {
    write_frame(stream, &response.to_value())
}

/// Handshake phase. Returns the bound resource, or `None` when the
/// session is over (a terminal status has already been sent where the
/// protocol calls for one).
fn bind(stream: &mut TcpStream, conn_id: HolderId, ctx: &SessionContext) -> Option<Arc<Resource>> {
    let frame = match read_frame(stream) {
        Ok(Received::Frame(value)) => value,
        Ok(Received::Closed) => return None,
        Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
            warn!("conn {}: malformed handshake: {}", conn_id, err);
            let _ = reply(stream, Response::ProtocolError);
            return None;
        }
        Err(err) => {
            warn!("conn {}: handshake read failed: {}", conn_id, err);
            return None;
        }
    };

    let name = match Request::parse(&frame) {
        Ok(Request::Spreadsheet { name }) => name,
        _ => {
            warn!("conn {}: first frame was not a handshake", conn_id);
            let _ = reply(stream, Response::ProtocolError);
            return None;
        }
    };

    let resource = match resolve_resource(ctx, &name, conn_id) {
        BindOutcome::Bound(resource) => resource,
        BindOutcome::NotFound => {
            info!("conn {}: {} not found", conn_id, name);
            let _ = reply(stream, Response::NotFound);
            return None;
        }
        BindOutcome::LockTimeout => {
            info!("conn {}: lock wait for {} timed out", conn_id, name);
            let _ = reply(
                stream,
                Response::Error("Timed out waiting for exclusive access.".to_string()),
            );
            return None;
        }
    };

    if reply(stream, Response::Ok).is_err() {
        resource.lock().release(conn_id);
        return None;
    }
    info!("conn {}: bound to {}", conn_id, name);
    Some(resource)
}

/// Outcome of resolving a handshake name to a locked resource.
enum BindOutcome {
    Bound(Arc<Resource>),
    NotFound,
    LockTimeout,
}

/// Look the name up with the retry budget, then take the resource's
/// content lock. The monitor may unload an entry and register a fresh
/// one for the same name between the lookup and the acquire; winning
/// the lock of an entry that is no longer in the registry must not
/// count as a bind, so after each acquire the registry is consulted
/// again and the lock is moved to the live entry if they differ.
fn resolve_resource(ctx: &SessionContext, name: &str, conn_id: HolderId) -> BindOutcome {
    let mut resource = None;
    for attempt in 0..ctx.lookup_attempts {
        if let Some(found) = ctx.registry.lookup(name) {
            resource = Some(found);
            break;
        }
        if attempt + 1 < ctx.lookup_attempts {
            debug!("conn {}: waiting for {}", conn_id, name);
            thread::sleep(Duration::from_secs(1));
        }
    }
    let mut resource = match resource {
        Some(resource) => resource,
        None => return BindOutcome::NotFound,
    };

    loop {
        if !resource.lock().acquire_timeout(conn_id, ctx.bind_timeout) {
            return BindOutcome::LockTimeout;
        }
        match ctx.registry.lookup(name) {
            Some(current) if Arc::ptr_eq(&current, &resource) => {
                return BindOutcome::Bound(resource);
            }
            Some(current) => {
                // The entry was replaced while we waited
                resource.lock().release(conn_id);
                resource = current;
            }
            None => {
                resource.lock().release(conn_id);
                return BindOutcome::NotFound;
            }
        }
    }
}

/// Bound phase: answer requests in arrival order until the peer goes
/// away or an unrecoverable error surfaces.
fn serve(stream: &mut TcpStream, resource: &Resource, conn_id: HolderId, ctx: &SessionContext) {
    loop {
        let frame = match read_frame(stream) {
            Ok(Received::Frame(value)) => value,
            Ok(Received::Closed) => break,
            Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
                warn!("conn {}: malformed frame: {}", conn_id, err);
                if reply(stream, Response::Error("Malformed request.".to_string())).is_err() {
                    break;
                }
                continue;
            }
            Err(err) => {
                warn!("conn {}: read failed: {}", conn_id, err);
                break;
            }
        };

        let request = match Request::parse(&frame) {
            Ok(request) => request,
            Err(err) => {
                if reply(stream, Response::Error(err.to_string())).is_err() {
                    break;
                }
                continue;
            }
        };

        let response = match dispatch(resource, conn_id, ctx, request) {
            Ok(response) => response,
            Err(ServerError::Validation(msg)) => Response::Error(msg),
            Err(ServerError::LockRequired) => {
                error!("conn {}: operation ran without the content lock", conn_id);
                break;
            }
            Err(err) => {
                warn!("conn {}: {}", conn_id, err);
                break;
            }
        };

        if reply(stream, response).is_err() {
            break;
        }
    }
}

/// Execute one bound-phase request against the resource.
pub fn dispatch(
    resource: &Resource,
    conn_id: HolderId,
    ctx: &SessionContext,
    request: Request,
) -> Result<Response, ServerError> {
    match request {
        Request::Spreadsheet { .. } => Err(ServerError::Validation(
            "Session is already bound to a spreadsheet.".to_string(),
        )),
        Request::Set {
            sheet,
            reference,
            data,
        } => {
            let range = parse_reference(&reference)?;
            if !resource.lock().is_held_by(conn_id) {
                return Err(ServerError::LockRequired);
            }
            let rows = shape_rows(&range, &data)?;
            resource.with_document(|doc| -> Result<(), EngineError> {
                // Check the sheet before the first write so a bad sheet
                // name cannot leave a partially written range behind.
                doc.read_cell(&sheet, range.start.row, range.start.col)?;
                for (dr, row) in rows.into_iter().enumerate() {
                    for (dc, value) in row.into_iter().enumerate() {
                        doc.write_cell(&sheet, range.start.row + dr, range.start.col + dc, value)?;
                    }
                }
                Ok(())
            })?;
            Ok(Response::Ok)
        }
        Request::Get { sheet, reference } => {
            let range = parse_reference(&reference)?;
            let data = resource.with_document(|doc| {
                read_shaped(doc, &sheet, &range)
            })?;
            Ok(Response::Data(data))
        }
        Request::GetSheets => {
            let names = resource.with_document(|doc| doc.sheet_names());
            Ok(Response::Data(Value::Array(
                names.into_iter().map(Value::String).collect(),
            )))
        }
        Request::Save { filename } => {
            if !resource.lock().is_held_by(conn_id) {
                return Err(ServerError::LockRequired);
            }
            // Only the final path component is honored, so a client
            // cannot write outside the save directory.
            let leaf = Path::new(&filename)
                .file_name()
                .ok_or_else(|| ServerError::Validation("Invalid filename.".to_string()))?;
            let target = ctx.save_dir.join(leaf);
            resource.with_document(|doc| doc.save(&target))?;
            info!("conn {}: saved {}", conn_id, target.display());
            Ok(Response::Ok)
        }
    }
}

/// Validate a SET payload against the range's classification and
/// convert it into a rows-by-columns value matrix. Scalars given as
/// numeric strings coerce to numbers.
fn shape_rows(range: &CellRange, data: &Value) -> Result<Vec<Vec<CellValue>>, ServerError> {
    match range.shape() {
        RangeShape::Single => {
            if data.is_array() {
                return Err(ServerError::Validation(
                    "Expected a single cell. A list of cells was given.".to_string(),
                ));
            }
            Ok(vec![vec![CellValue::from_json(data)?]])
        }
        RangeShape::Row => {
            let cells = flat_list(data, range.width())?;
            Ok(vec![cells])
        }
        RangeShape::Column => {
            let cells = flat_list(data, range.height())?;
            Ok(cells.into_iter().map(|cell| vec![cell]).collect())
        }
        RangeShape::Grid => {
            let rows = data.as_array().ok_or_else(|| {
                ServerError::Validation("Expecting list type.".to_string())
            })?;
            if rows.len() != range.height() {
                return Err(shape_mismatch());
            }
            let mut shaped = Vec::with_capacity(rows.len());
            for row in rows {
                let cells = row.as_array().ok_or_else(|| {
                    ServerError::Validation("Expected a list of cells.".to_string())
                })?;
                if cells.len() != range.width() {
                    return Err(shape_mismatch());
                }
                let mut converted = Vec::with_capacity(cells.len());
                for cell in cells {
                    converted.push(CellValue::from_json(cell)?);
                }
                shaped.push(converted);
            }
            Ok(shaped)
        }
    }
}

fn flat_list(data: &Value, expected: usize) -> Result<Vec<CellValue>, ServerError> {
    let cells = data
        .as_array()
        .ok_or_else(|| ServerError::Validation("Expecting list type.".to_string()))?;
    if cells.first().map_or(false, Value::is_array) {
        return Err(ServerError::Validation(
            "Got 2D list when expecting 1D list.".to_string(),
        ));
    }
    if cells.len() != expected {
        return Err(shape_mismatch());
    }
    cells
        .iter()
        .map(|cell| CellValue::from_json(cell).map_err(ServerError::from))
        .collect()
}

fn shape_mismatch() -> ServerError {
    ServerError::Validation("Data does not match the shape of the cell range.".to_string())
}

/// Read a range back out in the shape GET promises: a scalar for a
/// single cell, a flat list for a row or column, nested rows for a
/// grid.
fn read_shaped(
    doc: &mut dyn gridserve_engine::Document,
    sheet: &gridserve_core::SheetRef,
    range: &CellRange,
) -> Result<Value, ServerError> {
    match range.shape() {
        RangeShape::Single => {
            let value = doc.read_cell(sheet, range.start.row, range.start.col)?;
            Ok(value.to_json())
        }
        RangeShape::Row => {
            let mut cells = Vec::with_capacity(range.width());
            for col in range.start.col..=range.end.col {
                cells.push(doc.read_cell(sheet, range.start.row, col)?.to_json());
            }
            Ok(Value::Array(cells))
        }
        RangeShape::Column => {
            let mut cells = Vec::with_capacity(range.height());
            for row in range.start.row..=range.end.row {
                cells.push(doc.read_cell(sheet, row, range.start.col)?.to_json());
            }
            Ok(Value::Array(cells))
        }
        RangeShape::Grid => {
            let mut rows = Vec::with_capacity(range.height());
            for row in range.start.row..=range.end.row {
                let mut cells = Vec::with_capacity(range.width());
                for col in range.start.col..=range.end.col {
                    cells.push(doc.read_cell(sheet, row, col)?.to_json());
                }
                rows.push(Value::Array(cells));
            }
            Ok(Value::Array(rows))
        }
    }
}
