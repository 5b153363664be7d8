use super::response::result::ColumnType;
use super::TryFromPrimitiveError;
use std::sync::Arc;
use thiserror::Error;

/// An error that occurred while reading, framing or unframing a whole frame.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("Frame is compressed, but no compression negotiated for connection.")]
    NoCompressionNegotiated,
    #[error("Received frame marked as coming from a client")]
    FrameFromClient,
    #[error("Received frame marked as coming from the server")]
    FrameFromServer,
    #[error("Received a frame from version {0}, but only 1 is supported")]
    VersionNotSupported(u8),
    #[error("Frame header too short: expected {expected} bytes, received {received}")]
    HeaderTooShort { expected: usize, received: usize },
    #[error("Negative body length in frame header: {0}")]
    NegativeLength(i32),
    #[error("Declared body length {declared} does not match {available} available bytes")]
    LengthMismatch { declared: usize, available: usize },
    #[error("Connection was closed before body was read: missing {0} out of {1}")]
    ConnectionClosed(usize, usize),
    #[error("Frame decompression failed.")]
    FrameDecompression,
    #[error("Frame compression failed.")]
    FrameCompression,
    #[error(transparent)]
    StdIoError(#[from] std::io::Error),
    #[error("Unrecognized opcode: {0}")]
    TryFromPrimitiveError(#[from] TryFromPrimitiveError<u8>),
    #[error("Error compressing lz4 data {0}")]
    Lz4CompressError(#[from] lz4_flex::block::CompressError),
    #[error("Error decompressing lz4 data {0}")]
    Lz4DecompressError(#[from] lz4_flex::block::DecompressError),
}

/// An error that occurred while serializing a request body or parsing a response body.
#[derive(Error, Debug, Clone)]
pub enum ParseError {
    #[error("Could not deserialize frame: {0}")]
    BadIncomingData(String),
    #[error("Could not serialize frame: {0}")]
    BadDataToSerialize(String),
    #[error(transparent)]
    LowLevel(#[from] LowLevelDeserializationError),
    #[error("Type not yet implemented, id: {0}")]
    TypeNotImplemented(u16),
    #[error("Unknown result kind: {0}")]
    UnknownResultKind(i32),
    #[error("Body has {0} unread trailing bytes")]
    TrailingBytes(usize),
    #[error("Length of serialized data does not fit its length prefix: {0}")]
    TryFromIntError(#[from] std::num::TryFromIntError),
}

impl From<std::io::Error> for ParseError {
    fn from(err: std::io::Error) -> Self {
        ParseError::LowLevel(err.into())
    }
}

impl From<std::str::Utf8Error> for ParseError {
    fn from(err: std::str::Utf8Error) -> Self {
        ParseError::LowLevel(err.into())
    }
}

/// A low level deserialization error.
///
/// This type of error is returned when deserialization
/// of some primitive value fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum LowLevelDeserializationError {
    #[error(transparent)]
    IoError(Arc<std::io::Error>),
    #[error(transparent)]
    TryFromIntError(#[from] std::num::TryFromIntError),
    #[error(transparent)]
    TryFromSliceError(#[from] std::array::TryFromSliceError),
    #[error("Not enough bytes! expected: {expected}, received: {received}")]
    TooFewBytesReceived { expected: usize, received: usize },
    #[error("Invalid value length: {0}")]
    InvalidValueLength(i32),
    #[error("Unknown consistency: {0}")]
    UnknownConsistency(#[from] TryFromPrimitiveError<u16>),
    #[error("Invalid inet bytes length: {0}. Accepted lengths are 4 and 16 bytes.")]
    InvalidInetLength(u8),
    #[error("UTF8 deserialization failed: {0}")]
    UTF8DeserializationError(#[from] std::str::Utf8Error),
}

impl From<std::io::Error> for LowLevelDeserializationError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(Arc::new(value))
    }
}

/// An error returned by typed accessors of rows and collections.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CellAccessError {
    #[error("No current row, call next() first")]
    NoCurrentRow,
    #[error("Column index {index} out of range, the result has {count} columns")]
    ColumnIndexOutOfRange { index: usize, count: usize },
    #[error("No column named {0}")]
    NoSuchColumn(String),
    #[error("Column {index} has type {actual:?}, which cannot be read as {expected}")]
    TypeMismatch {
        index: usize,
        expected: &'static str,
        actual: ColumnType,
    },
    #[error("Column {index} is null")]
    Null { index: usize },
    /// The cell's declared length runs past the end of the frame body.
    #[error(
        "Malformed frame: cell {index} declares {declared} bytes, but only {available} are left"
    )]
    Truncated {
        index: usize,
        declared: usize,
        available: usize,
    },
    #[error("Element index {index} out of range, the collection has {count} elements")]
    ElementIndexOutOfRange { index: usize, count: usize },
    #[error("Malformed value: {0}")]
    Malformed(#[from] LowLevelDeserializationError),
}
