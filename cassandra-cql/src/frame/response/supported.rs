use crate::frame::frame_errors::ParseError;
use crate::frame::types;
use std::collections::HashMap;

#[derive(Debug)]
pub struct Supported {
    pub options: HashMap<String, Vec<String>>,
}

impl Supported {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let options = types::read_string_multimap(buf)?;

        Ok(Supported { options })
    }

    /// Whether the server lists `value` among the accepted values of `key`.
    pub fn supports(&self, key: &str, value: &str) -> bool {
        self.options
            .get(key)
            .is_some_and(|values| values.iter().any(|v| v == value))
    }
}
