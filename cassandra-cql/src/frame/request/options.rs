use crate::frame::frame_errors::ParseError;

use crate::frame::request::{DeserializableRequest, RequestOpcode, SerializableRequest};

pub struct Options;

impl SerializableRequest for Options {
    const OPCODE: RequestOpcode = RequestOpcode::Options;

    fn serialize(&self, _buf: &mut Vec<u8>) -> Result<(), ParseError> {
        Ok(())
    }
}

impl DeserializableRequest for Options {
    fn deserialize(_buf: &mut &[u8]) -> Result<Self, ParseError> {
        Ok(Options)
    }
}

/* Key names for options in SUPPORTED/STARTUP */
pub const COMPRESSION: &str = "COMPRESSION";
pub const CQL_VERSION: &str = "CQL_VERSION";

/* Value names for options in SUPPORTED/STARTUP */
pub const DEFAULT_CQL_VERSION: &str = "3.0.0";
