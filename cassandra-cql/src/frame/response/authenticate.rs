use crate::frame::frame_errors::ParseError;
use crate::frame::types;

// Implements Authenticate message.
#[derive(Debug)]
pub struct Authenticate {
    pub authenticator_name: String,
}

impl Authenticate {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let authenticator_name = types::read_string(buf)?.to_string();

        Ok(Authenticate { authenticator_name })
    }
}
