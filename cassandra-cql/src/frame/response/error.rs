use crate::errors::{DbError, WriteType};
use crate::frame::frame_errors::ParseError;
use crate::frame::types;
use byteorder::ReadBytesExt;
use bytes::Bytes;

#[derive(Debug, Clone)]
pub struct Error {
    pub error: DbError,
    pub reason: String,
}

impl Error {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let code = types::read_int(buf)?;
        let reason = types::read_string(buf)?.to_owned();

        let error: DbError = match code {
            0x0000 => DbError::ServerError,
            0x000A => DbError::ProtocolError,
            0x0100 => DbError::AuthenticationError,
            0x1000 => DbError::Unavailable {
                consistency: types::read_consistency(buf)?,
                required: types::read_int(buf)?,
                alive: types::read_int(buf)?,
            },
            0x1001 => DbError::Overloaded,
            0x1002 => DbError::IsBootstrapping,
            0x1003 => DbError::TruncateError,
            0x1100 => DbError::WriteTimeout {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                write_type: WriteType::from(types::read_string(buf)?),
            },
            0x1200 => DbError::ReadTimeout {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                data_present: buf.read_u8()? != 0,
            },
            0x2000 => DbError::SyntaxError,
            0x2100 => DbError::Unauthorized,
            0x2200 => DbError::Invalid,
            0x2300 => DbError::ConfigError,
            0x2400 => DbError::AlreadyExists {
                keyspace: types::read_string(buf)?.to_string(),
                table: types::read_string(buf)?.to_string(),
            },
            0x2500 => DbError::Unprepared {
                statement_id: Bytes::from(types::read_short_bytes(buf)?.to_owned()),
            },
            _ => DbError::Other(code),
        };

        Ok(Error { error, reason })
    }

    /// Writes the body of an ERROR frame carrying this error.
    pub fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_int(self.error.code(), buf);
        types::write_string(&self.reason, buf)?;
        match &self.error {
            DbError::Unavailable {
                consistency,
                required,
                alive,
            } => {
                types::write_consistency(*consistency, buf);
                types::write_int(*required, buf);
                types::write_int(*alive, buf);
            }
            DbError::WriteTimeout {
                consistency,
                received,
                required,
                write_type,
            } => {
                types::write_consistency(*consistency, buf);
                types::write_int(*received, buf);
                types::write_int(*required, buf);
                types::write_string(write_type.as_str(), buf)?;
            }
            DbError::ReadTimeout {
                consistency,
                received,
                required,
                data_present,
            } => {
                types::write_consistency(*consistency, buf);
                types::write_int(*received, buf);
                types::write_int(*required, buf);
                types::write_bool(*data_present, buf);
            }
            DbError::AlreadyExists { keyspace, table } => {
                types::write_string(keyspace, buf)?;
                types::write_string(table, buf)?;
            }
            DbError::Unprepared { statement_id } => {
                types::write_short_bytes(statement_id, buf)?;
            }
            _ => {}
        }
        Ok(())
    }
}
