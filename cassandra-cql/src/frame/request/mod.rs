pub mod credentials;
pub mod execute;
pub mod options;
pub mod prepare;
pub mod query;
pub mod register;
pub mod startup;

use crate::frame::frame_errors::ParseError;
use crate::frame::TryFromPrimitiveError;
use crate::Consistency;
use bytes::Bytes;

pub use credentials::Credentials;
pub use execute::Execute;
pub use options::Options;
pub use prepare::Prepare;
pub use query::Query;
pub use register::Register;
pub use startup::Startup;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RequestOpcode {
    Startup = 0x01,
    Credentials = 0x04,
    Options = 0x05,
    Query = 0x07,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
}

impl TryFrom<u8> for RequestOpcode {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Startup),
            0x04 => Ok(Self::Credentials),
            0x05 => Ok(Self::Options),
            0x07 => Ok(Self::Query),
            0x09 => Ok(Self::Prepare),
            0x0A => Ok(Self::Execute),
            0x0B => Ok(Self::Register),
            _ => Err(TryFromPrimitiveError {
                enum_name: "RequestOpcode",
                primitive: value,
            }),
        }
    }
}

pub trait SerializableRequest {
    const OPCODE: RequestOpcode;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ParseError>;

    fn to_bytes(&self) -> Result<Bytes, ParseError> {
        let mut v = Vec::new();
        self.serialize(&mut v)?;
        Ok(v.into())
    }
}

/// Not intended for driver's direct usage (as driver has no interest in deserialising CQL requests),
/// but very useful for testing (e.g. asserting that the sent requests have proper parameters set).
pub trait DeserializableRequest: SerializableRequest + Sized {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError>;
}

/// Any request a client may send, as seen by a server.
pub enum Request<'r> {
    Startup(Startup<'r>),
    Credentials(Credentials<'r>),
    Options(Options),
    Query(Query<'r>),
    Prepare(Prepare<'r>),
    Execute(Execute),
    Register(Register),
}

impl Request<'_> {
    pub fn deserialize(buf: &mut &[u8], opcode: RequestOpcode) -> Result<Self, ParseError> {
        let request = match opcode {
            RequestOpcode::Startup => Startup::deserialize(buf).map(Self::Startup),
            RequestOpcode::Credentials => Credentials::deserialize(buf).map(Self::Credentials),
            RequestOpcode::Options => Options::deserialize(buf).map(Self::Options),
            RequestOpcode::Query => Query::deserialize(buf).map(Self::Query),
            RequestOpcode::Prepare => Prepare::deserialize(buf).map(Self::Prepare),
            RequestOpcode::Execute => Execute::deserialize(buf).map(Self::Execute),
            RequestOpcode::Register => Register::deserialize(buf).map(Self::Register),
        }?;

        if !buf.is_empty() {
            return Err(ParseError::TrailingBytes(buf.len()));
        }
        Ok(request)
    }

    /// Retrieves consistency from request frame, if present.
    pub fn get_consistency(&self) -> Option<Consistency> {
        match self {
            Request::Query(q) => Some(q.consistency),
            Request::Execute(e) => Some(e.consistency),
            _ => None,
        }
    }
}
