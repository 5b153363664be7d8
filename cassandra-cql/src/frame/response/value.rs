//! Typed, borrowed views of single cells and collection elements.
//!
//! Values are never copied out of the frame body: a [`CqlValueRef`] points into
//! the body, and collection views keep a cheap [`Bytes`] handle to their part
//! of it. Elements of a collection are located by walking their length
//! prefixes, so malformed collections are only detected when accessed.

use crate::frame::frame_errors::{CellAccessError, LowLevelDeserializationError};
use crate::frame::response::result::ColumnType;
use crate::frame::types;
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use uuid::Uuid;

/// A non-null value of a known type, borrowed from a frame body.
#[derive(Debug, Clone, Copy)]
pub struct CqlValueRef<'a> {
    index: usize,
    typ: &'a ColumnType,
    raw: &'a [u8],
    backing: &'a Bytes,
}

impl<'a> CqlValueRef<'a> {
    /// `raw` must be a subslice of `backing`.
    pub(crate) fn new(
        index: usize,
        typ: &'a ColumnType,
        raw: &'a [u8],
        backing: &'a Bytes,
    ) -> Self {
        Self {
            index,
            typ,
            raw,
            backing,
        }
    }

    pub fn column_type(&self) -> &'a ColumnType {
        self.typ
    }

    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }

    /// The value's bytes, sharing the frame's allocation.
    pub fn as_bytes(&self) -> Bytes {
        self.backing.slice_ref(self.raw)
    }

    fn mismatch(&self, expected: &'static str) -> CellAccessError {
        CellAccessError::TypeMismatch {
            index: self.index,
            expected,
            actual: self.typ.clone(),
        }
    }

    fn fixed<const N: usize>(&self) -> Result<[u8; N], CellAccessError> {
        self.raw.try_into().map_err(|_| {
            LowLevelDeserializationError::TooFewBytesReceived {
                expected: N,
                received: self.raw.len(),
            }
            .into()
        })
    }

    pub fn as_bool(&self) -> Result<bool, CellAccessError> {
        match self.typ {
            ColumnType::Boolean => Ok(self.fixed::<1>()?[0] != 0),
            _ => Err(self.mismatch("boolean")),
        }
    }

    pub fn as_int(&self) -> Result<i32, CellAccessError> {
        match self.typ {
            ColumnType::Int => Ok(i32::from_be_bytes(self.fixed()?)),
            _ => Err(self.mismatch("int")),
        }
    }

    /// Reads a bigint, counter or timestamp (milliseconds since the epoch).
    pub fn as_bigint(&self) -> Result<i64, CellAccessError> {
        match self.typ {
            ColumnType::BigInt | ColumnType::Counter | ColumnType::Timestamp => {
                Ok(i64::from_be_bytes(self.fixed()?))
            }
            _ => Err(self.mismatch("bigint")),
        }
    }

    pub fn as_float(&self) -> Result<f32, CellAccessError> {
        match self.typ {
            ColumnType::Float => Ok(f32::from_be_bytes(self.fixed()?)),
            _ => Err(self.mismatch("float")),
        }
    }

    pub fn as_double(&self) -> Result<f64, CellAccessError> {
        match self.typ {
            ColumnType::Double => Ok(f64::from_be_bytes(self.fixed()?)),
            _ => Err(self.mismatch("double")),
        }
    }

    pub fn as_str(&self) -> Result<&'a str, CellAccessError> {
        match self.typ {
            ColumnType::Ascii | ColumnType::Text | ColumnType::Varchar => {
                std::str::from_utf8(self.raw)
                    .map_err(|e| LowLevelDeserializationError::from(e).into())
            }
            _ => Err(self.mismatch("string")),
        }
    }

    pub fn as_uuid(&self) -> Result<Uuid, CellAccessError> {
        match self.typ {
            ColumnType::Uuid | ColumnType::Timeuuid => Ok(Uuid::from_bytes(self.fixed()?)),
            _ => Err(self.mismatch("uuid")),
        }
    }

    pub fn as_inet(&self) -> Result<IpAddr, CellAccessError> {
        if *self.typ != ColumnType::Inet {
            return Err(self.mismatch("inet"));
        }
        match self.raw.len() {
            4 => Ok(IpAddr::V4(Ipv4Addr::from(self.fixed::<4>()?))),
            16 => Ok(IpAddr::V6(Ipv6Addr::from(self.fixed::<16>()?))),
            len => Err(LowLevelDeserializationError::InvalidInetLength(len as u8).into()),
        }
    }

    pub fn as_list(&self) -> Result<ListView, CellAccessError> {
        match self.typ {
            ColumnType::List(elem) => Ok(ListView(self.elements(elem)?)),
            _ => Err(self.mismatch("list")),
        }
    }

    pub fn as_set(&self) -> Result<SetView, CellAccessError> {
        match self.typ {
            ColumnType::Set(elem) => Ok(SetView(self.elements(elem)?)),
            _ => Err(self.mismatch("set")),
        }
    }

    pub fn as_map(&self) -> Result<MapView, CellAccessError> {
        match self.typ {
            ColumnType::Map(key, value) => {
                let (count, data) = self.collection_header()?;
                Ok(MapView {
                    key_type: (**key).clone(),
                    value_type: (**value).clone(),
                    count,
                    data,
                })
            }
            _ => Err(self.mismatch("map")),
        }
    }

    fn collection_header(&self) -> Result<(usize, Bytes), CellAccessError> {
        let mut raw = self.raw;
        let buf = &mut raw;
        let count = types::read_short_length(buf).map_err(LowLevelDeserializationError::from)?;
        Ok((count, self.backing.slice_ref(buf)))
    }

    fn elements(&self, element_type: &ColumnType) -> Result<Elements, CellAccessError> {
        let (count, data) = self.collection_header()?;
        Ok(Elements {
            element_type: element_type.clone(),
            count,
            data,
        })
    }
}

/// Returns the `n`-th `[short bytes]` entry of `data`.
fn nth_entry(data: &Bytes, n: usize) -> Result<&[u8], CellAccessError> {
    let buf = &mut &data[..];
    for _ in 0..n {
        types::read_short_bytes(buf)?;
    }
    Ok(types::read_short_bytes(buf)?)
}

#[derive(Debug, Clone)]
struct Elements {
    element_type: ColumnType,
    count: usize,
    data: Bytes,
}

impl Elements {
    fn get(&self, index: usize) -> Result<CqlValueRef<'_>, CellAccessError> {
        if index >= self.count {
            return Err(CellAccessError::ElementIndexOutOfRange {
                index,
                count: self.count,
            });
        }
        let raw = nth_entry(&self.data, index)?;
        Ok(CqlValueRef::new(index, &self.element_type, raw, &self.data))
    }
}

macro_rules! impl_element_view {
    ($view:ident) => {
        impl $view {
            pub fn len(&self) -> usize {
                self.0.count
            }

            pub fn is_empty(&self) -> bool {
                self.0.count == 0
            }

            pub fn element_type(&self) -> &ColumnType {
                &self.0.element_type
            }

            pub fn get(&self, index: usize) -> Result<CqlValueRef<'_>, CellAccessError> {
                self.0.get(index)
            }

            pub fn get_data(&self, index: usize) -> Result<Bytes, CellAccessError> {
                Ok(self.get(index)?.as_bytes())
            }

            pub fn get_bool(&self, index: usize) -> Result<bool, CellAccessError> {
                self.get(index)?.as_bool()
            }

            pub fn get_int(&self, index: usize) -> Result<i32, CellAccessError> {
                self.get(index)?.as_int()
            }

            pub fn get_bigint(&self, index: usize) -> Result<i64, CellAccessError> {
                self.get(index)?.as_bigint()
            }

            pub fn get_float(&self, index: usize) -> Result<f32, CellAccessError> {
                self.get(index)?.as_float()
            }

            pub fn get_double(&self, index: usize) -> Result<f64, CellAccessError> {
                self.get(index)?.as_double()
            }

            pub fn get_string(&self, index: usize) -> Result<&str, CellAccessError> {
                self.get(index)?.as_str()
            }

            pub fn get_uuid(&self, index: usize) -> Result<Uuid, CellAccessError> {
                self.get(index)?.as_uuid()
            }
        }
    };
}

/// A lazily decoded `list<T>` value.
#[derive(Debug, Clone)]
pub struct ListView(Elements);

/// A lazily decoded `set<T>` value.
#[derive(Debug, Clone)]
pub struct SetView(Elements);

impl_element_view!(ListView);
impl_element_view!(SetView);

/// A lazily decoded `map<K, V>` value. Keys and values alternate in the body.
#[derive(Debug, Clone)]
pub struct MapView {
    key_type: ColumnType,
    value_type: ColumnType,
    count: usize,
    data: Bytes,
}

impl MapView {
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn key_type(&self) -> &ColumnType {
        &self.key_type
    }

    pub fn value_type(&self) -> &ColumnType {
        &self.value_type
    }

    fn check_index(&self, index: usize) -> Result<(), CellAccessError> {
        if index >= self.count {
            return Err(CellAccessError::ElementIndexOutOfRange {
                index,
                count: self.count,
            });
        }
        Ok(())
    }

    pub fn get_key(&self, index: usize) -> Result<CqlValueRef<'_>, CellAccessError> {
        self.check_index(index)?;
        let raw = nth_entry(&self.data, 2 * index)?;
        Ok(CqlValueRef::new(index, &self.key_type, raw, &self.data))
    }

    pub fn get_value(&self, index: usize) -> Result<CqlValueRef<'_>, CellAccessError> {
        self.check_index(index)?;
        let raw = nth_entry(&self.data, 2 * index + 1)?;
        Ok(CqlValueRef::new(index, &self.value_type, raw, &self.data))
    }

    pub fn get_key_string(&self, index: usize) -> Result<&str, CellAccessError> {
        self.get_key(index)?.as_str()
    }

    pub fn get_key_int(&self, index: usize) -> Result<i32, CellAccessError> {
        self.get_key(index)?.as_int()
    }

    pub fn get_value_string(&self, index: usize) -> Result<&str, CellAccessError> {
        self.get_value(index)?.as_str()
    }

    pub fn get_value_int(&self, index: usize) -> Result<i32, CellAccessError> {
        self.get_value(index)?.as_int()
    }

    pub fn get_value_bigint(&self, index: usize) -> Result<i64, CellAccessError> {
        self.get_value(index)?.as_bigint()
    }

    pub fn get_value_double(&self, index: usize) -> Result<f64, CellAccessError> {
        self.get_value(index)?.as_double()
    }
}
