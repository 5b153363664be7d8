pub mod authenticate;
pub mod error;
pub mod event;
pub mod result;
pub mod rows;
pub mod supported;
pub mod value;

use crate::frame::frame_errors::ParseError;
use bytes::Bytes;

pub use error::Error;
pub use rows::{ColumnIndex, Rows};
pub use supported::Supported;
pub use value::{CqlValueRef, ListView, MapView, SetView};

use super::TryFromPrimitiveError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ResponseOpcode {
    Error = 0x00,
    Ready = 0x02,
    Authenticate = 0x03,
    Supported = 0x06,
    Result = 0x08,
    Event = 0x0C,
}

impl TryFrom<u8> for ResponseOpcode {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, TryFromPrimitiveError<u8>> {
        match value {
            0x00 => Ok(Self::Error),
            0x02 => Ok(Self::Ready),
            0x03 => Ok(Self::Authenticate),
            0x06 => Ok(Self::Supported),
            0x08 => Ok(Self::Result),
            0x0C => Ok(Self::Event),
            _ => Err(TryFromPrimitiveError {
                enum_name: "ResponseOpcode",
                primitive: value,
            }),
        }
    }
}

#[derive(Debug)]
pub enum Response {
    Error(Error),
    Ready,
    Result(result::Result),
    Authenticate(authenticate::Authenticate),
    Supported(Supported),
    Event(event::Event),
}

impl Response {
    /// Parses a (decompressed, extension-free) response body.
    ///
    /// The body is taken as [`Bytes`] so that rows can reference it without copying.
    pub fn deserialize(opcode: ResponseOpcode, body: Bytes) -> Result<Response, ParseError> {
        let buf = &mut &*body;
        let response = match opcode {
            ResponseOpcode::Error => Response::Error(Error::deserialize(buf)?),
            ResponseOpcode::Ready => Response::Ready,
            ResponseOpcode::Authenticate => {
                Response::Authenticate(authenticate::Authenticate::deserialize(buf)?)
            }
            ResponseOpcode::Supported => Response::Supported(Supported::deserialize(buf)?),
            ResponseOpcode::Result => Response::Result(result::deserialize(body.clone())?),
            ResponseOpcode::Event => Response::Event(event::Event::deserialize(buf)?),
        };

        Ok(response)
    }

    pub fn opcode(&self) -> ResponseOpcode {
        match self {
            Response::Error(_) => ResponseOpcode::Error,
            Response::Ready => ResponseOpcode::Ready,
            Response::Result(_) => ResponseOpcode::Result,
            Response::Authenticate(_) => ResponseOpcode::Authenticate,
            Response::Supported(_) => ResponseOpcode::Supported,
            Response::Event(_) => ResponseOpcode::Event,
        }
    }

    pub fn into_non_error_response(self) -> Result<NonErrorResponse, Error> {
        Ok(match self {
            Response::Error(err) => return Err(err),
            Response::Ready => NonErrorResponse::Ready,
            Response::Result(res) => NonErrorResponse::Result(res),
            Response::Authenticate(auth) => NonErrorResponse::Authenticate(auth),
            Response::Supported(sup) => NonErrorResponse::Supported(sup),
            Response::Event(eve) => NonErrorResponse::Event(eve),
        })
    }
}

// A Response which can not be Response::Error
#[derive(Debug)]
pub enum NonErrorResponse {
    Ready,
    Result(result::Result),
    Authenticate(authenticate::Authenticate),
    Supported(Supported),
    Event(event::Event),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DbError;
    use crate::frame::types;
    use assert_matches::assert_matches;

    #[test]
    fn opcodes() {
        for opcode in [0x00, 0x02, 0x03, 0x06, 0x08, 0x0C] {
            assert_eq!(ResponseOpcode::try_from(opcode).unwrap() as u8, opcode);
        }
        assert!(ResponseOpcode::try_from(0x01).is_err());
        assert!(ResponseOpcode::try_from(0x0E).is_err());
    }

    #[test]
    fn dispatch_by_opcode() {
        let ready = Response::deserialize(ResponseOpcode::Ready, Bytes::new()).unwrap();
        assert_eq!(ready.opcode(), ResponseOpcode::Ready);
        assert_matches!(ready.into_non_error_response(), Ok(NonErrorResponse::Ready));

        let mut body = Vec::new();
        types::write_int(0x2200, &mut body);
        types::write_string("unconfigured table", &mut body).unwrap();
        let error = Response::deserialize(ResponseOpcode::Error, body.into()).unwrap();
        let err = error.into_non_error_response().unwrap_err();
        assert_eq!(err.error, DbError::Invalid);
        assert_eq!(err.reason, "unconfigured table");

        let mut body = Vec::new();
        types::write_string("org.apache.cassandra.auth.PasswordAuthenticator", &mut body).unwrap();
        assert_matches!(
            Response::deserialize(ResponseOpcode::Authenticate, body.into()),
            Ok(Response::Authenticate(auth))
                if auth.authenticator_name == "org.apache.cassandra.auth.PasswordAuthenticator"
        );

        assert_matches!(
            Response::deserialize(ResponseOpcode::Result, Bytes::from_static(&[0, 0, 0, 1])),
            Ok(Response::Result(result::Result::Void))
        );
    }
}
