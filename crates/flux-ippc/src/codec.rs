//! Frame codec façade.
//!
//! A frame on the wire is `L | size (L bytes, big-endian) | payload (size
//! bytes)`. `L` is the minimal number of bytes needed to represent
//! `payload.len()`, always at least 1 (`L == 0` is invalid and never
//! produced here).
//!
//! The payload itself is a `serde_json`-encoded [`Request`] (client -> server)
//! or [`Response`] (server -> client). Rust's static typing plus `serde` make
//! a process-global type registry unnecessary here (see DESIGN.md).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ConnectionError, RemoteError};

/// Request payload: `(name, args, kwargs)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

/// Response payload. `Err` is a value that is itself an error instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ok(Value),
    Err(RemoteError),
}

impl Response {
    pub fn is_err(&self) -> bool {
        matches!(self, Response::Err(_))
    }
}

/// Largest payload this codec will frame. `L` is capped at 255 bytes, so the
/// theoretical ceiling is `256^255`; in practice we never need more than a
/// `u64`-sized length, which also keeps `parse_size` infallible for any frame
/// this implementation itself produces.
const MAX_SIZE_BYTES: usize = size_of::<u64>();

/// Returns the minimal big-endian byte width needed to hold `size`, at least 1.
fn size_width(size: usize) -> u8 {
    let bytes = (size as u64).to_be_bytes();
    let leading_zero_bytes = bytes.iter().take_while(|b| **b == 0).count();
    let width = bytes.len() - leading_zero_bytes;
    width.max(1) as u8
}

/// Builds the `L | size | payload` framing around an already-serialized
/// payload.
fn frame(payload: &[u8]) -> Vec<u8> {
    let l = size_width(payload.len());
    let size_bytes = (payload.len() as u64).to_be_bytes();
    let mut out = Vec::with_capacity(1 + l as usize + payload.len());
    out.push(l);
    out.extend_from_slice(&size_bytes[size_bytes.len() - l as usize..]);
    out.extend_from_slice(payload);
    out
}

/// Encodes a [`Request`] into a framed byte string ready to write to the wire.
pub fn encode_request(req: &Request) -> Result<Vec<u8>, ConnectionError> {
    let payload = serde_json::to_vec(req)
        .map_err(|e| ConnectionError::FramingFailure(format!("encoding request: {e}")))?;
    Ok(frame(&payload))
}

/// Encodes a [`Response`] into a framed byte string ready to write to the wire.
pub fn encode_response(resp: &Response) -> Result<Vec<u8>, ConnectionError> {
    let payload = serde_json::to_vec(resp)
        .map_err(|e| ConnectionError::FramingFailure(format!("encoding response: {e}")))?;
    Ok(frame(&payload))
}

pub fn decode_request(payload: &[u8]) -> Result<Request, ConnectionError> {
    serde_json::from_slice(payload)
        .map_err(|e| ConnectionError::FramingFailure(format!("decoding request: {e}")))
}

pub fn decode_response(payload: &[u8]) -> Result<Response, ConnectionError> {
    serde_json::from_slice(payload)
        .map_err(|e| ConnectionError::FramingFailure(format!("decoding response: {e}")))
}

/// Inverse of the size encoding: `size_bytes` is exactly `L` bytes long, as
/// read off the wire (the length-of-length byte itself is consumed by the
/// caller before this is called).
pub fn parse_size(size_bytes: &[u8]) -> Result<usize, ConnectionError> {
    if size_bytes.is_empty() || size_bytes.len() > MAX_SIZE_BYTES {
        return Err(ConnectionError::FramingFailure(format!(
            "invalid size prefix width {}",
            size_bytes.len()
        )));
    }
    let mut buf = [0u8; MAX_SIZE_BYTES];
    buf[MAX_SIZE_BYTES - size_bytes.len()..].copy_from_slice(size_bytes);
    Ok(u64::from_be_bytes(buf) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_width_boundaries() {
        assert_eq!(size_width(0), 1);
        assert_eq!(size_width(1), 1);
        assert_eq!(size_width(254), 1);
        assert_eq!(size_width(255), 1);
        assert_eq!(size_width(256), 2);
        assert_eq!(size_width(65535), 2);
        assert_eq!(size_width(65536), 3);
    }

    #[test]
    fn frame_round_trip_boundaries() {
        for len in [1usize, 254, 255, 256, 65535, 65536] {
            let payload = vec![0xABu8; len];
            let framed = frame(&payload);
            let l = framed[0] as usize;
            assert_eq!(l, size_width(len) as usize);
            let size = parse_size(&framed[1..1 + l]).unwrap();
            assert_eq!(size, len);
            assert_eq!(&framed[1 + l..], payload.as_slice());
            assert_eq!(framed.len(), 1 + l + len);
        }
    }

    #[test]
    fn request_round_trips() {
        let req = Request {
            name: "math.add".to_string(),
            args: vec![Value::from(2), Value::from(3)],
            kwargs: Map::new(),
        };
        let framed = encode_request(&req).unwrap();
        let l = framed[0] as usize;
        let size = parse_size(&framed[1..1 + l]).unwrap();
        let payload = &framed[1 + l..1 + l + size];
        let decoded = decode_request(payload).unwrap();
        assert_eq!(decoded.name, "math.add");
        assert_eq!(decoded.args, req.args);
    }

    #[test]
    fn response_err_round_trips() {
        let resp = Response::Err(RemoteError::no_such_method("nope"));
        let framed = encode_response(&resp).unwrap();
        let l = framed[0] as usize;
        let size = parse_size(&framed[1..1 + l]).unwrap();
        let payload = &framed[1 + l..1 + l + size];
        let decoded = decode_response(payload).unwrap();
        assert!(decoded.is_err());
    }
}
