use crate::frame::frame_errors::ParseError;

use std::borrow::Cow;

use crate::frame::{
    request::{DeserializableRequest, RequestOpcode, SerializableRequest},
    types,
};

pub struct Prepare<'a> {
    pub query: Cow<'a, str>,
}

impl SerializableRequest for Prepare<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Prepare;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_long_string(&self.query, buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Prepare<'_> {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let query = Cow::Owned(types::read_long_string(buf)?.to_owned());
        Ok(Self { query })
    }
}
