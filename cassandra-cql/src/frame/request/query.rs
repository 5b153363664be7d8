use std::borrow::Cow;

use crate::frame::frame_errors::ParseError;
use crate::frame::{
    request::{DeserializableRequest, RequestOpcode, SerializableRequest},
    types,
};

/// Version 1 QUERY: the statement text followed by its consistency.
#[cfg_attr(test, derive(Debug, PartialEq, Eq))]
pub struct Query<'q> {
    pub contents: Cow<'q, str>,
    pub consistency: types::Consistency,
}

impl SerializableRequest for Query<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Query;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_long_string(&self.contents, buf)?;
        types::write_consistency(self.consistency, buf);
        Ok(())
    }
}

impl DeserializableRequest for Query<'_> {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let contents = Cow::Owned(types::read_long_string(buf)?.to_owned());
        let consistency = types::read_consistency(buf)?;

        Ok(Self {
            contents,
            consistency,
        })
    }
}
