pub mod frame_errors;
pub mod request;
pub mod response;
pub mod server_event_type;
pub mod types;

use crate::frame::frame_errors::FrameError;
use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use std::convert::TryFrom;
use std::fmt::Display;

use request::{RequestOpcode, SerializableRequest};
use response::ResponseOpcode;

/// Size of the version 1 frame header:
/// `[version:1][flags:1][stream:1][opcode:1][length:4]`.
pub const HEADER_SIZE: usize = 8;

/// The only protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u8 = 0x01;

// Set on the version byte of frames sent by the server.
const DIRECTION_RESPONSE: u8 = 0x80;

// Frame flags
pub const FLAG_COMPRESSION: u8 = 0x01;
pub const FLAG_TRACING: u8 = 0x02;

/// Stream used for connection management (OPTIONS, STARTUP, REGISTER, ...).
pub const MANAGEMENT_STREAM_ID: i8 = 0;

/// Stream the server uses for EVENT frames.
pub const EVENT_STREAM_ID: i8 = -1;

/// The wire protocol compression algorithm.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Compression {
    /// LZ4 compression algorithm.
    Lz4,
    /// Snappy compression algorithm.
    Snappy,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Lz4 => "lz4",
            Compression::Snappy => "snappy",
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded fixed-size frame header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub flags: u8,
    pub stream: i8,
    pub opcode: u8,
    pub length: i32,
}

impl FrameHeader {
    pub fn is_response(&self) -> bool {
        self.version & DIRECTION_RESPONSE != 0
    }

    pub fn protocol_version(&self) -> u8 {
        self.version & !DIRECTION_RESPONSE
    }
}

pub fn encode_header(
    version: u8,
    flags: u8,
    stream: i8,
    opcode: u8,
    length: i32,
) -> [u8; HEADER_SIZE] {
    let mut raw = [0u8; HEADER_SIZE];
    raw[0] = version;
    raw[1] = flags;
    raw[2] = stream as u8;
    raw[3] = opcode;
    raw[4..8].copy_from_slice(&length.to_be_bytes());
    raw
}

/// Decodes the header fields without judging them, so any header written by
/// [`encode_header`] decodes back to the same values.
pub fn decode_header(raw: &[u8]) -> Result<FrameHeader, FrameError> {
    if raw.len() < HEADER_SIZE {
        return Err(FrameError::HeaderTooShort {
            expected: HEADER_SIZE,
            received: raw.len(),
        });
    }
    let mut buf = &raw[..HEADER_SIZE];

    Ok(FrameHeader {
        version: buf.get_u8(),
        flags: buf.get_u8(),
        stream: buf.get_i8(),
        opcode: buf.get_u8(),
        length: buf.get_i32(),
    })
}

/// Splits a complete in-memory frame into its header and body.
///
/// The body must be exactly as long as the header declares.
pub fn split_frame(raw: &[u8]) -> Result<(FrameHeader, &[u8]), FrameError> {
    let header = decode_header(raw)?;
    let declared = body_length(&header)?;
    let body = &raw[HEADER_SIZE..];
    if body.len() != declared {
        return Err(FrameError::LengthMismatch {
            declared,
            available: body.len(),
        });
    }
    Ok((header, body))
}

fn body_length(header: &FrameHeader) -> Result<usize, FrameError> {
    usize::try_from(header.length).map_err(|_| FrameError::NegativeLength(header.length))
}

pub struct SerializedRequest {
    data: Vec<u8>,
}

impl SerializedRequest {
    pub fn make<R: SerializableRequest>(
        req: &R,
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<SerializedRequest, FrameError> {
        let mut flags = 0;
        let mut data = vec![0; HEADER_SIZE];

        if let Some(compression) = compression {
            flags |= FLAG_COMPRESSION;
            let body = req.to_bytes()?;
            compress_append(&body, compression, &mut data)?;
        } else {
            req.serialize(&mut data)?;
        }

        if tracing {
            flags |= FLAG_TRACING;
        }

        let req_size = i32::try_from(data.len() - HEADER_SIZE)
            .map_err(frame_errors::ParseError::TryFromIntError)?;
        let header = encode_header(PROTOCOL_VERSION, flags, 0, R::OPCODE as u8, req_size);
        data[..HEADER_SIZE].copy_from_slice(&header);

        Ok(Self { data })
    }

    pub fn set_stream(&mut self, stream: i8) {
        self.data[2] = stream as u8;
    }

    pub fn get_stream(&self) -> i8 {
        self.data[2] as i8
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data[..]
    }
}

// Parts of the frame header which are not determined by the request/response type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    pub version: u8,
    pub flags: u8,
    pub stream: i8,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags: 0x00,
            stream: 0,
        }
    }
}

pub async fn read_response_frame(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameError> {
    let (header, body) = read_frame(reader).await?;
    if !header.is_response() {
        return Err(FrameError::FrameFromClient);
    }
    let opcode = ResponseOpcode::try_from(header.opcode)?;

    Ok((frame_params(&header), opcode, body))
}

/// Server side counterpart of [`read_response_frame`].
pub async fn read_request_frame(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<(FrameParams, RequestOpcode, Bytes), FrameError> {
    let (header, body) = read_frame(reader).await?;
    if header.is_response() {
        return Err(FrameError::FrameFromServer);
    }
    let opcode = RequestOpcode::try_from(header.opcode)?;

    Ok((frame_params(&header), opcode, body))
}

fn frame_params(header: &FrameHeader) -> FrameParams {
    FrameParams {
        version: header.version,
        flags: header.flags,
        stream: header.stream,
    }
}

async fn read_frame(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<(FrameHeader, Bytes), FrameError> {
    let mut raw_header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw_header[..]).await?;

    let header = decode_header(&raw_header)?;
    if header.protocol_version() != PROTOCOL_VERSION {
        return Err(FrameError::VersionNotSupported(header.protocol_version()));
    }

    // TODO: Guard from frames that are too large
    let length = body_length(&header)?;

    let mut raw_body = Vec::with_capacity(length).limit(length);
    while raw_body.has_remaining_mut() {
        let n = reader.read_buf(&mut raw_body).await?;
        if n == 0 {
            // EOF, too early
            return Err(FrameError::ConnectionClosed(
                raw_body.remaining_mut(),
                length,
            ));
        }
    }

    Ok((header, raw_body.into_inner().into()))
}

#[derive(Debug)]
pub struct ResponseBodyWithExtensions {
    pub trace_id: Option<Uuid>,
    pub body: Bytes,
}

pub fn parse_response_body_extensions(
    flags: u8,
    compression: Option<Compression>,
    mut body: Bytes,
) -> Result<ResponseBodyWithExtensions, FrameError> {
    if flags & FLAG_COMPRESSION != 0 {
        if let Some(compression) = compression {
            body = decompress(&body, compression)?.into();
        } else {
            return Err(FrameError::NoCompressionNegotiated);
        }
    }

    let trace_id = if flags & FLAG_TRACING != 0 {
        let buf = &mut &*body;
        let trace_id = types::read_uuid(buf).map_err(frame_errors::ParseError::from)?;
        body.advance(16);
        Some(trace_id)
    } else {
        None
    };

    Ok(ResponseBodyWithExtensions { trace_id, body })
}

pub fn compress_append(
    uncomp_body: &[u8],
    compression: Compression,
    out: &mut Vec<u8>,
) -> Result<(), FrameError> {
    match compression {
        Compression::Lz4 => {
            let uncomp_len = uncomp_body.len() as u32;
            let tmp = lz4_flex::compress(uncomp_body);
            out.reserve_exact(std::mem::size_of::<u32>() + tmp.len());
            out.put_u32(uncomp_len);
            out.extend_from_slice(&tmp[..]);
            Ok(())
        }
        Compression::Snappy => {
            let old_size = out.len();
            out.resize(old_size + snap::raw::max_compress_len(uncomp_body.len()), 0);
            let compressed_size = snap::raw::Encoder::new()
                .compress(uncomp_body, &mut out[old_size..])
                .map_err(|_| FrameError::FrameCompression)?;
            out.truncate(old_size + compressed_size);
            Ok(())
        }
    }
}

pub fn decompress(mut comp_body: &[u8], compression: Compression) -> Result<Vec<u8>, FrameError> {
    match compression {
        Compression::Lz4 => {
            if comp_body.len() < std::mem::size_of::<u32>() {
                return Err(FrameError::FrameDecompression);
            }
            let uncomp_len = comp_body.get_u32() as usize;
            let uncomp_body = lz4_flex::decompress(comp_body, uncomp_len)?;
            Ok(uncomp_body)
        }
        Compression::Snappy => snap::raw::Decoder::new()
            .decompress_vec(comp_body)
            .map_err(|_| FrameError::FrameDecompression),
    }
}

/// An error type for parsing an enum value from a primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No discrimant in enum `{enum_name}` matches the value `{primitive:?}`")]
pub struct TryFromPrimitiveError<T: Copy + std::fmt::Debug> {
    enum_name: &'static str,
    primitive: T,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::request::options::Options;
    use assert_matches::assert_matches;

    #[test]
    fn header_encodes_bit_exact() {
        let raw = encode_header(0x01, 0x00, 1, ResponseOpcode::Ready as u8, 5);
        assert_eq!(raw, [0x01, 0x00, 0x01, 0x02, 0x00, 0x00, 0x00, 0x05]);
    }

    #[test]
    fn header_round_trip() {
        let versions = [0x00, 0x01, 0x81, 0xff];
        let flags = [0x00, FLAG_COMPRESSION, FLAG_TRACING, 0xff];
        let streams = [i8::MIN, -1, 0, 1, 127];
        let opcodes = [0x00, 0x02, 0x0c, 0xff];
        let lengths = [i32::MIN, -1, 0, 5, 0x0102_0304, i32::MAX];

        for &v in &versions {
            for &f in &flags {
                for &s in &streams {
                    for &o in &opcodes {
                        for &l in &lengths {
                            let decoded = decode_header(&encode_header(v, f, s, o, l)).unwrap();
                            assert_eq!(
                                decoded,
                                FrameHeader {
                                    version: v,
                                    flags: f,
                                    stream: s,
                                    opcode: o,
                                    length: l,
                                }
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn header_too_short() {
        assert_matches!(
            decode_header(&[0x01, 0x00, 0x01]),
            Err(FrameError::HeaderTooShort {
                expected: 8,
                received: 3
            })
        );
    }

    #[test]
    fn split_frame_checks_declared_length() {
        let mut frame = encode_header(0x81, 0, 1, 0x02, 3).to_vec();
        frame.extend_from_slice(&[1, 2, 3]);
        let (header, body) = split_frame(&frame).unwrap();
        assert_eq!(header.length, 3);
        assert_eq!(body, &[1, 2, 3]);

        // One byte missing.
        assert_matches!(
            split_frame(&frame[..frame.len() - 1]),
            Err(FrameError::LengthMismatch {
                declared: 3,
                available: 2
            })
        );

        // Trailing garbage is not silently ignored either.
        frame.push(4);
        assert_matches!(
            split_frame(&frame),
            Err(FrameError::LengthMismatch {
                declared: 3,
                available: 4
            })
        );

        let negative = encode_header(0x81, 0, 1, 0x02, -1);
        assert_matches!(split_frame(&negative), Err(FrameError::NegativeLength(-1)));
    }

    #[test]
    fn serialized_request_layout() {
        let mut req = SerializedRequest::make(&Options, None, false).unwrap();
        req.set_stream(42);
        assert_eq!(req.get_stream(), 42);
        assert_eq!(
            req.get_data(),
            &[0x01, 0x00, 42, RequestOpcode::Options as u8, 0, 0, 0, 0]
        );
    }

    #[tokio::test]
    async fn read_response_frame_reads_exactly_one_frame() {
        let mut data = encode_header(0x81, 0, 3, ResponseOpcode::Ready as u8, 0).to_vec();
        // Start of the next frame must stay unread.
        data.extend_from_slice(&encode_header(0x81, 0, 4, ResponseOpcode::Ready as u8, 0));
        let mut reader = &data[..];

        let (params, opcode, body) = read_response_frame(&mut reader).await.unwrap();
        assert_eq!(params.stream, 3);
        assert_eq!(opcode, ResponseOpcode::Ready);
        assert!(body.is_empty());
        assert_eq!(reader.len(), HEADER_SIZE);
    }

    #[tokio::test]
    async fn read_response_frame_rejects_eof_in_body() {
        let mut data = encode_header(0x81, 0, 3, ResponseOpcode::Result as u8, 10).to_vec();
        data.extend_from_slice(&[0, 0, 0, 1]);
        let mut reader = &data[..];
        assert_matches!(
            read_response_frame(&mut reader).await,
            Err(FrameError::ConnectionClosed(6, 10))
        );
    }

    #[tokio::test]
    async fn read_response_frame_rejects_wrong_direction_and_version() {
        let data = encode_header(0x01, 0, 3, ResponseOpcode::Ready as u8, 0);
        assert_matches!(
            read_response_frame(&mut &data[..]).await,
            Err(FrameError::FrameFromClient)
        );

        let data = encode_header(0x84, 0, 3, ResponseOpcode::Ready as u8, 0);
        assert_matches!(
            read_response_frame(&mut &data[..]).await,
            Err(FrameError::VersionNotSupported(4))
        );

        let data = encode_header(0x81, 0, 3, 0x42, 0);
        assert_matches!(
            read_response_frame(&mut &data[..]).await,
            Err(FrameError::TryFromPrimitiveError(_))
        );
    }

    #[test]
    fn test_lz4_compress() {
        let mut out = Vec::from(&b"Hello"[..]);
        let uncomp_body = b", World!";
        let compression = Compression::Lz4;
        let expect = vec![
            72, 101, 108, 108, 111, 0, 0, 0, 8, 128, 44, 32, 87, 111, 114, 108, 100, 33,
        ];

        compress_append(uncomp_body, compression, &mut out).unwrap();
        assert_eq!(expect, out);
    }

    #[test]
    fn test_snappy_round_trip() {
        let mut comp_body = Vec::new();
        let uncomp_body = "Hello, World!".repeat(100);
        compress_append(uncomp_body.as_bytes(), Compression::Snappy, &mut comp_body).unwrap();
        assert!(comp_body.len() < uncomp_body.len());
        let result = decompress(&comp_body[..], Compression::Snappy).unwrap();
        assert_eq!(uncomp_body.as_bytes(), result);
    }

    #[test]
    fn body_extensions_require_negotiated_compression() {
        let body = Bytes::from_static(&[1, 2, 3]);
        assert_matches!(
            parse_response_body_extensions(FLAG_COMPRESSION, None, body),
            Err(FrameError::NoCompressionNegotiated)
        );
    }
}
