//! Workbook server wire protocol.
//!
//! Each message is a 4-byte big-endian length prefix followed by that
//! many bytes of UTF-8 encoded JSON. Requests are JSON arrays whose
//! first element is a command token; responses are plain JSON values.
//!
//! The receive side never overloads a value as a connection-state
//! signal: [`Received`] tags "the peer went away" distinctly from any
//! payload, so a legitimate `false` in the stream cannot be mistaken
//! for a hangup.

use std::fmt;
use std::io::{self, Read, Write};

use serde_json::Value;

use gridserve_core::SheetRef;

/// Reference idle-read timeout, in seconds. Transports set this as the
/// socket read timeout; the codec maps a stalled read to [`Received::Closed`].
pub const IDLE_TIMEOUT_SECS: u64 = 10;

/// Upper bound on a frame's declared payload length. A hostile or
/// corrupt length prefix fails fast instead of allocating gigabytes.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Result of reading one frame from the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    /// A complete, well-formed JSON payload.
    Frame(Value),
    /// The connection is gone: zero-length read, EOF mid-frame, or a
    /// read that stalled past the idle timeout.
    Closed,
}

/// Read exactly `buf.len()` bytes, or report the connection closed.
///
/// A zero-length read on a still-open stream, EOF, and a timed-out read
/// all collapse to `Closed`; genuine I/O failures propagate.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<Option<()>> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Ok(None),
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::UnexpectedEof
                    || e.kind() == io::ErrorKind::ConnectionReset =>
            {
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(Some(()))
}

/// Read one length-prefixed frame.
///
/// Malformed JSON inside a complete frame is an `InvalidData` error;
/// the frame boundary itself was sound, so the caller may keep the
/// connection and answer with a protocol-level error.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Received> {
    let mut len_buf = [0u8; 4];
    if read_full(reader, &mut len_buf)?.is_none() {
        return Ok(Received::Closed);
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {} exceeds limit {}", len, MAX_FRAME_LEN),
        ));
    }

    let mut payload = vec![0u8; len as usize];
    if read_full(reader, &mut payload)?.is_none() {
        return Ok(Received::Closed);
    }

    let value = serde_json::from_slice(&payload)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Received::Frame(value))
}

/// Write one length-prefixed frame and flush.
pub fn write_frame<W: Write>(writer: &mut W, value: &Value) -> io::Result<()> {
    let payload = serde_json::to_vec(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame payload exceeds length limit",
        ));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()
}

// =============================================================================
// Requests
// =============================================================================

/// A parsed client request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Handshake: bind this connection to a named resource.
    Spreadsheet { name: String },
    /// Write a scalar or array payload into a cell or range.
    Set {
        sheet: SheetRef,
        reference: String,
        data: Value,
    },
    /// Read a cell or range.
    Get { sheet: SheetRef, reference: String },
    /// List the bound resource's sheet names, in order.
    GetSheets,
    /// Save the bound resource under a new filename.
    Save { filename: String },
}

/// Why a request payload could not be parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestError {
    /// Payload is not a JSON array.
    NotAnArray,
    /// Array is empty or its first element is not a command string.
    MissingCommand,
    /// First element is not a recognized command token.
    UnknownCommand(String),
    /// Right command, wrong number of elements.
    BadArity { command: &'static str, expected: usize },
    /// An element has the wrong type.
    BadArgument { command: &'static str, detail: &'static str },
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAnArray => write!(f, "request must be a JSON array"),
            Self::MissingCommand => write!(f, "request array is missing a command token"),
            Self::UnknownCommand(cmd) => write!(f, "unknown command: {}", cmd),
            Self::BadArity { command, expected } => {
                write!(f, "{} expects {} element(s)", command, expected)
            }
            Self::BadArgument { command, detail } => write!(f, "{}: {}", command, detail),
        }
    }
}

impl std::error::Error for RequestError {}

fn string_arg(
    items: &[Value],
    index: usize,
    command: &'static str,
    detail: &'static str,
) -> Result<String, RequestError> {
    items[index]
        .as_str()
        .map(str::to_string)
        .ok_or(RequestError::BadArgument { command, detail })
}

fn sheet_arg(items: &[Value], index: usize, command: &'static str) -> Result<SheetRef, RequestError> {
    match &items[index] {
        Value::String(name) => Ok(SheetRef::Name(name.clone())),
        Value::Number(n) => n
            .as_u64()
            .map(|i| SheetRef::Index(i as usize))
            .ok_or(RequestError::BadArgument {
                command,
                detail: "sheet index must be a non-negative integer",
            }),
        _ => Err(RequestError::BadArgument {
            command,
            detail: "sheet must be a name or an index",
        }),
    }
}

impl Request {
    /// Parse a request payload. The handshake command is parsed with
    /// the same rules as everything else; the session decides whether
    /// it is acceptable in the current state.
    pub fn parse(payload: &Value) -> Result<Self, RequestError> {
        let items = payload.as_array().ok_or(RequestError::NotAnArray)?;
        let command = items
            .first()
            .and_then(Value::as_str)
            .ok_or(RequestError::MissingCommand)?;

        match command {
            "SPREADSHEET" => {
                if items.len() != 2 {
                    return Err(RequestError::BadArity {
                        command: "SPREADSHEET",
                        expected: 2,
                    });
                }
                let name = string_arg(items, 1, "SPREADSHEET", "name must be a string")?;
                Ok(Request::Spreadsheet { name })
            }
            "SET" => {
                if items.len() != 4 {
                    return Err(RequestError::BadArity {
                        command: "SET",
                        expected: 4,
                    });
                }
                Ok(Request::Set {
                    sheet: sheet_arg(items, 1, "SET")?,
                    reference: string_arg(items, 2, "SET", "cell reference must be a string")?,
                    data: items[3].clone(),
                })
            }
            "GET" => {
                if items.len() != 3 {
                    return Err(RequestError::BadArity {
                        command: "GET",
                        expected: 3,
                    });
                }
                Ok(Request::Get {
                    sheet: sheet_arg(items, 1, "GET")?,
                    reference: string_arg(items, 2, "GET", "cell reference must be a string")?,
                })
            }
            "GET_SHEETS" => {
                if items.len() != 1 {
                    return Err(RequestError::BadArity {
                        command: "GET_SHEETS",
                        expected: 1,
                    });
                }
                Ok(Request::GetSheets)
            }
            "SAVE" => {
                if items.len() != 2 {
                    return Err(RequestError::BadArity {
                        command: "SAVE",
                        expected: 2,
                    });
                }
                let filename = string_arg(items, 1, "SAVE", "filename must be a string")?;
                Ok(Request::Save { filename })
            }
            other => Err(RequestError::UnknownCommand(other.to_string())),
        }
    }
}

// =============================================================================
// Responses
// =============================================================================

/// A server response. The v1 wire format is frozen: the three status
/// strings and the `{"ERROR": msg}` object are matched literally by
/// existing clients.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok,
    NotFound,
    ProtocolError,
    Error(String),
    Data(Value),
}

impl Response {
    pub fn to_value(&self) -> Value {
        match self {
            Self::Ok => Value::String("OK".to_string()),
            Self::NotFound => Value::String("NOT FOUND".to_string()),
            Self::ProtocolError => Value::String("PROTOCOL ERROR".to_string()),
            Self::Error(message) => serde_json::json!({ "ERROR": message }),
            Self::Data(value) => value.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_round_trip() {
        let value = serde_json::json!(["SET", "Sheet1", "A1", 5]);
        let mut buf = Vec::new();
        write_frame(&mut buf, &value).unwrap();

        // 4-byte big-endian prefix, then the payload
        let payload_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(payload_len, buf.len() - 4);

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap(), Received::Frame(value));
    }

    #[test]
    fn empty_stream_reads_as_closed() {
        let mut cursor = Cursor::new(Vec::new());
        assert_eq!(read_frame(&mut cursor).unwrap(), Received::Closed);
    }

    #[test]
    fn truncated_prefix_reads_as_closed() {
        let mut cursor = Cursor::new(vec![0, 0]);
        assert_eq!(read_frame(&mut cursor).unwrap(), Received::Closed);
    }

    #[test]
    fn truncated_payload_reads_as_closed() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &serde_json::json!("OK")).unwrap();
        buf.truncate(buf.len() - 1);
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap(), Received::Closed);
    }

    #[test]
    fn false_payload_is_a_frame_not_a_hangup() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &serde_json::json!(false)).unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(
            read_frame(&mut cursor).unwrap(),
            Received::Frame(Value::Bool(false))
        );
    }

    #[test]
    fn oversized_length_prefix_is_an_error() {
        let mut buf = (MAX_FRAME_LEN + 1).to_be_bytes().to_vec();
        buf.extend_from_slice(b"xxxx");
        let mut cursor = Cursor::new(buf);
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn malformed_json_in_complete_frame_is_an_error() {
        let payload = b"{not json";
        let mut buf = (payload.len() as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(payload);
        let mut cursor = Cursor::new(buf);
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn parse_handshake() {
        let req = Request::parse(&serde_json::json!(["SPREADSHEET", "budget.json"])).unwrap();
        assert_eq!(
            req,
            Request::Spreadsheet {
                name: "budget.json".to_string()
            }
        );
    }

    #[test]
    fn parse_set_with_sheet_name_and_index() {
        let by_name = Request::parse(&serde_json::json!(["SET", "Sheet1", "A1", 5])).unwrap();
        assert_eq!(
            by_name,
            Request::Set {
                sheet: SheetRef::Name("Sheet1".to_string()),
                reference: "A1".to_string(),
                data: serde_json::json!(5),
            }
        );

        let by_index = Request::parse(&serde_json::json!(["SET", 0, "A1:A3", [4, 5, 6]])).unwrap();
        assert!(matches!(
            by_index,
            Request::Set {
                sheet: SheetRef::Index(0),
                ..
            }
        ));
    }

    #[test]
    fn parse_get_sheets_and_save() {
        assert_eq!(
            Request::parse(&serde_json::json!(["GET_SHEETS"])).unwrap(),
            Request::GetSheets
        );
        assert_eq!(
            Request::parse(&serde_json::json!(["SAVE", "out.json"])).unwrap(),
            Request::Save {
                filename: "out.json".to_string()
            }
        );
    }

    #[test]
    fn parse_rejects_malformed_requests() {
        assert_eq!(
            Request::parse(&serde_json::json!("SET")),
            Err(RequestError::NotAnArray)
        );
        assert_eq!(
            Request::parse(&serde_json::json!([])),
            Err(RequestError::MissingCommand)
        );
        assert_eq!(
            Request::parse(&serde_json::json!([42, "x"])),
            Err(RequestError::MissingCommand)
        );
        assert!(matches!(
            Request::parse(&serde_json::json!(["DELETE", "x"])),
            Err(RequestError::UnknownCommand(_))
        ));
        assert!(matches!(
            Request::parse(&serde_json::json!(["SET", "Sheet1", "A1"])),
            Err(RequestError::BadArity { .. })
        ));
        assert!(matches!(
            Request::parse(&serde_json::json!(["GET", true, "A1"])),
            Err(RequestError::BadArgument { .. })
        ));
        assert!(matches!(
            Request::parse(&serde_json::json!(["SPREADSHEET", "a", "b"])),
            Err(RequestError::BadArity { .. })
        ));
    }

    #[test]
    fn response_wire_values() {
        assert_eq!(Response::Ok.to_value(), serde_json::json!("OK"));
        assert_eq!(Response::NotFound.to_value(), serde_json::json!("NOT FOUND"));
        assert_eq!(
            Response::ProtocolError.to_value(),
            serde_json::json!("PROTOCOL ERROR")
        );
        assert_eq!(
            Response::Error("Cell range is invalid.".to_string()).to_value(),
            serde_json::json!({"ERROR": "Cell range is invalid."})
        );
        assert_eq!(
            Response::Data(serde_json::json!([4, 5, 6])).to_value(),
            serde_json::json!([4, 5, 6])
        );
    }
}
