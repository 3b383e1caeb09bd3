//! Binary tunnel frame serialization/deserialization.
//!
//! All integers are big-endian, all strings UTF-8. The leading byte selects
//! the frame type; there is no frame-level checksum (the transport is
//! reliable and ordered). Layouts:
//!
//! - `HTTP_REQUEST` (0x01): u32 request_id, u16 method_len, method,
//!   u16 path_len, path, u32 headers_len, headers_json, u32 body_len, body
//! - `HTTP_RESPONSE` (0x02): u32 request_id, u16 status_code,
//!   u32 headers_len, headers_json, u32 body_len, body
//! - `WS_CONNECT` (0x10): u32 connection_id, u16 url_len, url,
//!   u32 headers_len, headers_json
//! - `WS_DATA` (0x11): u32 connection_id, u8 opcode, u32 payload_len, payload
//! - `WS_CLOSE` (0x12): u32 connection_id, u16 close_code, u16 reason_len,
//!   reason
//!
//! `headers_json` is the UTF-8 encoding of a JSON object mapping header
//! names to single string values.

use std::collections::BTreeMap;

/// Header map carried in HTTP and WS_CONNECT frames.
///
/// A `BTreeMap` keeps the JSON encoding deterministic.
pub type Headers = BTreeMap<String, String>;

/// Frame type discriminants (the leading wire byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    HttpRequest = 0x01,
    HttpResponse = 0x02,
    WsConnect = 0x10,
    WsData = 0x11,
    WsClose = 0x12,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(byte: u8) -> Result<Self, FrameError> {
        match byte {
            0x01 => Ok(Self::HttpRequest),
            0x02 => Ok(Self::HttpResponse),
            0x10 => Ok(Self::WsConnect),
            0x11 => Ok(Self::WsData),
            0x12 => Ok(Self::WsClose),
            other => Err(FrameError::UnknownFrameType(other)),
        }
    }
}

/// WebSocket opcodes carried in WS_DATA frames (RFC 6455 subset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WsOpcode {
    Continuation = 0x00,
    Text = 0x01,
    Binary = 0x02,
    Close = 0x08,
    Ping = 0x09,
    Pong = 0x0A,
}

impl TryFrom<u8> for WsOpcode {
    type Error = FrameError;

    fn try_from(byte: u8) -> Result<Self, FrameError> {
        match byte {
            0x00 => Ok(Self::Continuation),
            0x01 => Ok(Self::Text),
            0x02 => Ok(Self::Binary),
            0x08 => Ok(Self::Close),
            0x09 => Ok(Self::Ping),
            0x0A => Ok(Self::Pong),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }
}

/// Errors from frame encoding/decoding.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown frame type: 0x{0:02x}")]
    UnknownFrameType(u8),

    #[error("unknown websocket opcode: {0}")]
    UnknownOpcode(u8),

    #[error("insufficient data for {0}")]
    Truncated(&'static str),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("invalid headers JSON: {0}")]
    InvalidHeaders(String),

    #[error("{0} exceeds its length prefix")]
    FieldTooLong(&'static str),
}

/// HTTP request frame (0x01).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequestFrame {
    pub request_id: u32,
    pub method: String,
    pub path: String,
    pub headers: Headers,
    pub body: String,
}

/// HTTP response frame (0x02).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponseFrame {
    pub request_id: u32,
    pub status_code: u16,
    pub headers: Headers,
    pub body: String,
}

/// WebSocket CONNECT frame (0x10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsConnectFrame {
    pub connection_id: u32,
    pub url: String,
    pub headers: Headers,
}

/// WebSocket DATA frame (0x11).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsDataFrame {
    pub connection_id: u32,
    pub opcode: WsOpcode,
    pub payload: Vec<u8>,
}

/// WebSocket CLOSE frame (0x12).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsCloseFrame {
    pub connection_id: u32,
    pub close_code: u16,
    pub reason: String,
}

/// A decoded tunnel frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    HttpRequest(HttpRequestFrame),
    HttpResponse(HttpResponseFrame),
    WsConnect(WsConnectFrame),
    WsData(WsDataFrame),
    WsClose(WsCloseFrame),
}

impl Frame {
    /// The wire discriminant of this frame.
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::HttpRequest(_) => FrameType::HttpRequest,
            Self::HttpResponse(_) => FrameType::HttpResponse,
            Self::WsConnect(_) => FrameType::WsConnect,
            Self::WsData(_) => FrameType::WsData,
            Self::WsClose(_) => FrameType::WsClose,
        }
    }

    /// Serialize this frame to its wire encoding.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        match self {
            Self::HttpRequest(f) => f.encode(),
            Self::HttpResponse(f) => f.encode(),
            Self::WsConnect(f) => f.encode(),
            Self::WsData(f) => f.encode(),
            Self::WsClose(f) => f.encode(),
        }
    }

    /// Parse a frame from its wire encoding, dispatching on the first byte.
    ///
    /// A first byte outside the known set yields
    /// [`FrameError::UnknownFrameType`].
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        let mut r = Reader::new(buf);
        let frame_type = FrameType::try_from(r.u8("frame_type")?)?;

        match frame_type {
            FrameType::HttpRequest => {
                let request_id = r.u32("request_id")?;
                let method = r.string_u16("method")?;
                let path = r.string_u16("path")?;
                let headers = r.headers()?;
                let body = r.string_u32("body")?;
                Ok(Self::HttpRequest(HttpRequestFrame {
                    request_id,
                    method,
                    path,
                    headers,
                    body,
                }))
            }
            FrameType::HttpResponse => {
                let request_id = r.u32("request_id")?;
                let status_code = r.u16("status_code")?;
                let headers = r.headers()?;
                let body = r.string_u32("body")?;
                Ok(Self::HttpResponse(HttpResponseFrame {
                    request_id,
                    status_code,
                    headers,
                    body,
                }))
            }
            FrameType::WsConnect => {
                let connection_id = r.u32("connection_id")?;
                let url = r.string_u16("url")?;
                let headers = r.headers()?;
                Ok(Self::WsConnect(WsConnectFrame {
                    connection_id,
                    url,
                    headers,
                }))
            }
            FrameType::WsData => {
                let connection_id = r.u32("connection_id")?;
                let opcode = WsOpcode::try_from(r.u8("opcode")?)?;
                let len = r.u32("payload_len")? as usize;
                let payload = r.bytes(len, "payload")?.to_vec();
                Ok(Self::WsData(WsDataFrame {
                    connection_id,
                    opcode,
                    payload,
                }))
            }
            FrameType::WsClose => {
                let connection_id = r.u32("connection_id")?;
                let close_code = r.u16("close_code")?;
                let reason = r.string_u16("reason")?;
                Ok(Self::WsClose(WsCloseFrame {
                    connection_id,
                    close_code,
                    reason,
                }))
            }
        }
    }
}

impl HttpRequestFrame {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let headers = encode_headers(&self.headers);
        let mut out = Vec::with_capacity(
            16 + self.method.len() + self.path.len() + headers.len() + self.body.len(),
        );
        out.push(FrameType::HttpRequest as u8);
        out.extend_from_slice(&self.request_id.to_be_bytes());
        put_u16_prefixed(&mut out, self.method.as_bytes(), "method")?;
        put_u16_prefixed(&mut out, self.path.as_bytes(), "path")?;
        put_u32_prefixed(&mut out, &headers, "headers")?;
        put_u32_prefixed(&mut out, self.body.as_bytes(), "body")?;
        Ok(out)
    }
}

impl HttpResponseFrame {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let headers = encode_headers(&self.headers);
        let mut out = Vec::with_capacity(15 + headers.len() + self.body.len());
        out.push(FrameType::HttpResponse as u8);
        out.extend_from_slice(&self.request_id.to_be_bytes());
        out.extend_from_slice(&self.status_code.to_be_bytes());
        put_u32_prefixed(&mut out, &headers, "headers")?;
        put_u32_prefixed(&mut out, self.body.as_bytes(), "body")?;
        Ok(out)
    }
}

impl WsConnectFrame {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let headers = encode_headers(&self.headers);
        let mut out = Vec::with_capacity(11 + self.url.len() + headers.len());
        out.push(FrameType::WsConnect as u8);
        out.extend_from_slice(&self.connection_id.to_be_bytes());
        put_u16_prefixed(&mut out, self.url.as_bytes(), "url")?;
        put_u32_prefixed(&mut out, &headers, "headers")?;
        Ok(out)
    }
}

impl WsDataFrame {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::with_capacity(10 + self.payload.len());
        out.push(FrameType::WsData as u8);
        out.extend_from_slice(&self.connection_id.to_be_bytes());
        out.push(self.opcode as u8);
        put_u32_prefixed(&mut out, &self.payload, "payload")?;
        Ok(out)
    }
}

impl WsCloseFrame {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::with_capacity(9 + self.reason.len());
        out.push(FrameType::WsClose as u8);
        out.extend_from_slice(&self.connection_id.to_be_bytes());
        out.extend_from_slice(&self.close_code.to_be_bytes());
        put_u16_prefixed(&mut out, self.reason.as_bytes(), "reason")?;
        Ok(out)
    }
}

fn encode_headers(headers: &Headers) -> Vec<u8> {
    // Serializing a string->string map cannot fail.
    serde_json::to_vec(headers).unwrap_or_else(|_| b"{}".to_vec())
}

fn put_u16_prefixed(out: &mut Vec<u8>, data: &[u8], field: &'static str) -> Result<(), FrameError> {
    let len = u16::try_from(data.len()).map_err(|_| FrameError::FieldTooLong(field))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(data);
    Ok(())
}

fn put_u32_prefixed(out: &mut Vec<u8>, data: &[u8], field: &'static str) -> Result<(), FrameError> {
    let len = u32::try_from(data.len()).map_err(|_| FrameError::FieldTooLong(field))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(data);
    Ok(())
}

/// Cursor over a frame buffer with per-field truncation errors.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], FrameError> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or(FrameError::Truncated(field))?;
        if end > self.buf.len() {
            return Err(FrameError::Truncated(field));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, FrameError> {
        Ok(self.bytes(1, field)?[0])
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, FrameError> {
        let b = self.bytes(2, field)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, FrameError> {
        let b = self.bytes(4, field)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string_u16(&mut self, field: &'static str) -> Result<String, FrameError> {
        let len = self.u16(field)? as usize;
        let bytes = self.bytes(len, field)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| FrameError::InvalidUtf8(field))
    }

    fn string_u32(&mut self, field: &'static str) -> Result<String, FrameError> {
        let len = self.u32(field)? as usize;
        let bytes = self.bytes(len, field)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| FrameError::InvalidUtf8(field))
    }

    fn headers(&mut self) -> Result<Headers, FrameError> {
        let len = self.u32("headers_len")? as usize;
        let bytes = self.bytes(len, "headers")?;
        if bytes.is_empty() {
            return Ok(Headers::new());
        }
        serde_json::from_slice(bytes).map_err(|e| FrameError::InvalidHeaders(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn roundtrip(frame: Frame) {
        let encoded = frame.encode().unwrap();
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn http_request_roundtrip() {
        roundtrip(Frame::HttpRequest(HttpRequestFrame {
            request_id: 1,
            method: "GET".into(),
            path: "/v1/health".into(),
            headers: headers(&[("accept", "application/json")]),
            body: String::new(),
        }));
    }

    #[test]
    fn http_request_roundtrip_with_body() {
        roundtrip(Frame::HttpRequest(HttpRequestFrame {
            request_id: 42,
            method: "POST".into(),
            path: "/api/chat?stream=true".into(),
            headers: headers(&[("content-type", "application/json"), ("x-req", "abc")]),
            body: r#"{"prompt":"hello"}"#.into(),
        }));
    }

    #[test]
    fn http_response_roundtrip() {
        roundtrip(Frame::HttpResponse(HttpResponseFrame {
            request_id: 42,
            status_code: 200,
            headers: headers(&[("content-type", "application/json")]),
            body: r#"{"status":"ok"}"#.into(),
        }));
    }

    #[test]
    fn ws_connect_roundtrip() {
        roundtrip(Frame::WsConnect(WsConnectFrame {
            connection_id: 7,
            url: "ws://localhost:3000/ws?room=1".into(),
            headers: headers(&[("origin", "http://localhost:3000")]),
        }));
    }

    #[test]
    fn ws_data_roundtrip_text_and_binary() {
        roundtrip(Frame::WsData(WsDataFrame {
            connection_id: 7,
            opcode: WsOpcode::Text,
            payload: "héllo wörld".as_bytes().to_vec(),
        }));
        roundtrip(Frame::WsData(WsDataFrame {
            connection_id: 7,
            opcode: WsOpcode::Binary,
            payload: vec![0x00, 0xFF, 0x80, 0x7F],
        }));
    }

    #[test]
    fn ws_close_roundtrip() {
        roundtrip(Frame::WsClose(WsCloseFrame {
            connection_id: 9,
            close_code: 1000,
            reason: "normal closure".into(),
        }));
    }

    #[test]
    fn zero_length_fields_accepted() {
        roundtrip(Frame::HttpRequest(HttpRequestFrame {
            request_id: 0,
            method: "GET".into(),
            path: "/".into(),
            headers: Headers::new(),
            body: String::new(),
        }));
        roundtrip(Frame::WsData(WsDataFrame {
            connection_id: 0,
            opcode: WsOpcode::Ping,
            payload: Vec::new(),
        }));
        roundtrip(Frame::WsClose(WsCloseFrame {
            connection_id: 0,
            close_code: 1006,
            reason: String::new(),
        }));
    }

    #[test]
    fn max_request_id_roundtrip() {
        roundtrip(Frame::HttpResponse(HttpResponseFrame {
            request_id: u32::MAX,
            status_code: 599,
            headers: Headers::new(),
            body: String::new(),
        }));
    }

    #[test]
    fn multibyte_utf8_roundtrip() {
        roundtrip(Frame::HttpRequest(HttpRequestFrame {
            request_id: 3,
            method: "GET".into(),
            path: "/файл/ファイル?q=søk".into(),
            headers: headers(&[("x-näme", "värde-日本")]),
            body: "тело 本文 😀".into(),
        }));
        roundtrip(Frame::WsClose(WsCloseFrame {
            connection_id: 3,
            close_code: 1001,
            reason: "再見 👋".into(),
        }));
    }

    #[test]
    fn unknown_frame_type_rejected() {
        // A response frame body with a bogus leading byte.
        let frame = HttpResponseFrame {
            request_id: 1,
            status_code: 200,
            headers: Headers::new(),
            body: String::new(),
        };
        let mut encoded = frame.encode().unwrap();
        encoded[0] = 0x7F;
        assert_eq!(
            Frame::decode(&encoded),
            Err(FrameError::UnknownFrameType(0x7F))
        );

        assert_eq!(Frame::decode(&[0xFF]), Err(FrameError::UnknownFrameType(0xFF)));
    }

    #[test]
    fn empty_buffer_rejected() {
        assert_eq!(
            Frame::decode(&[]),
            Err(FrameError::Truncated("frame_type"))
        );
    }

    #[test]
    fn truncated_frames_rejected() {
        let frame = Frame::HttpRequest(HttpRequestFrame {
            request_id: 5,
            method: "DELETE".into(),
            path: "/x".into(),
            headers: headers(&[("a", "b")]),
            body: "body".into(),
        });
        let encoded = frame.encode().unwrap();

        // Every proper prefix must fail to decode.
        for cut in 1..encoded.len() {
            assert!(
                Frame::decode(&encoded[..cut]).is_err(),
                "prefix of {cut} bytes decoded unexpectedly"
            );
        }
    }

    #[test]
    fn unknown_opcode_rejected() {
        let frame = WsDataFrame {
            connection_id: 1,
            opcode: WsOpcode::Text,
            payload: vec![1, 2, 3],
        };
        let mut encoded = frame.encode().unwrap();
        // Opcode sits after type byte and connection id.
        encoded[5] = 0x0F;
        assert_eq!(Frame::decode(&encoded), Err(FrameError::UnknownOpcode(0x0F)));
    }

    #[test]
    fn invalid_headers_json_rejected() {
        let mut out = vec![FrameType::WsConnect as u8];
        out.extend_from_slice(&1u32.to_be_bytes());
        out.extend_from_slice(&2u16.to_be_bytes());
        out.extend_from_slice(b"ws");
        out.extend_from_slice(&3u32.to_be_bytes());
        out.extend_from_slice(b"{{{");
        assert!(matches!(
            Frame::decode(&out),
            Err(FrameError::InvalidHeaders(_))
        ));
    }

    #[test]
    fn no_trailing_padding() {
        let frame = Frame::WsClose(WsCloseFrame {
            connection_id: 1,
            close_code: 1000,
            reason: "bye".into(),
        });
        let encoded = frame.encode().unwrap();
        // type + connection_id + close_code + reason_len + reason
        assert_eq!(encoded.len(), 1 + 4 + 2 + 2 + 3);
    }
}
