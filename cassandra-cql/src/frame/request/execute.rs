use bytes::Bytes;

use crate::frame::frame_errors::ParseError;
use crate::frame::{
    request::{DeserializableRequest, RequestOpcode, SerializableRequest},
    types,
};

/// Version 1 EXECUTE: prepared id, positional values and consistency.
#[cfg_attr(test, derive(Debug, PartialEq, Eq))]
pub struct Execute {
    pub id: Bytes,
    /// `None` is sent as a null value.
    pub values: Vec<Option<Bytes>>,
    pub consistency: types::Consistency,
}

impl SerializableRequest for Execute {
    const OPCODE: RequestOpcode = RequestOpcode::Execute;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_short_bytes(&self.id[..], buf)?;
        let count: u16 = self.values.len().try_into()?;
        types::write_short(count, buf);
        for value in &self.values {
            types::write_bytes_opt(value.as_ref(), buf)?;
        }
        types::write_consistency(self.consistency, buf);
        Ok(())
    }
}

impl DeserializableRequest for Execute {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let id = Bytes::copy_from_slice(types::read_short_bytes(buf)?);
        let count = types::read_short(buf)?;
        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            values.push(types::read_bytes_opt(buf)?.map(Bytes::copy_from_slice));
        }
        let consistency = types::read_consistency(buf)?;

        Ok(Self {
            id,
            values,
            consistency,
        })
    }
}
