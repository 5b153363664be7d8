//! `CREDENTIALS` answers an `AUTHENTICATE` challenge with a plain string map,
//! e.g. `username`/`password` for the password authenticator.

use crate::frame::frame_errors::ParseError;

use std::{borrow::Cow, collections::HashMap};

use crate::frame::{
    request::{DeserializableRequest, RequestOpcode, SerializableRequest},
    types,
};

pub struct Credentials<'a> {
    pub credentials: HashMap<Cow<'a, str>, Cow<'a, str>>,
}

impl<'a> Credentials<'a> {
    pub fn username_password(username: &'a str, password: &'a str) -> Self {
        let mut credentials = HashMap::new();
        credentials.insert(Cow::Borrowed("username"), Cow::Borrowed(username));
        credentials.insert(Cow::Borrowed("password"), Cow::Borrowed(password));
        Self { credentials }
    }
}

impl SerializableRequest for Credentials<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Credentials;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_string_map(&self.credentials, buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Credentials<'_> {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let credentials = types::read_string_map(buf)?
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Ok(Self { credentials })
    }
}
