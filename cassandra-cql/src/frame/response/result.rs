use crate::frame::frame_errors::ParseError;
use crate::frame::response::rows::Rows;
use crate::frame::types;
use bytes::Bytes;

#[derive(Debug)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

#[derive(Debug)]
pub struct Prepared {
    pub id: Bytes,
    pub metadata: ResultMetadata,
}

/// Version 1 SCHEMA_CHANGE result: change kind, keyspace and (possibly empty) table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChange {
    pub change: String,
    pub keyspace: String,
    pub table: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableSpec {
    pub ks_name: String,
    pub table_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Custom(String),
    Ascii,
    BigInt,
    Blob,
    Boolean,
    Counter,
    Decimal,
    Double,
    Float,
    Int,
    Text,
    Timestamp,
    Uuid,
    Varchar,
    Varint,
    Timeuuid,
    Inet,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
}

impl ColumnType {
    pub fn is_collection(&self) -> bool {
        matches!(
            self,
            ColumnType::List(_) | ColumnType::Map(_, _) | ColumnType::Set(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub table_spec: TableSpec,
    pub name: String,
    pub typ: ColumnType,
}

#[derive(Debug, Clone, Default)]
pub struct ResultMetadata {
    pub flags: i32,
    pub col_count: usize,
    pub global_table_spec: Option<TableSpec>,
    pub col_specs: Vec<ColumnSpec>,
}

impl ResultMetadata {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.col_specs.iter().position(|spec| spec.name == name)
    }
}

#[derive(Debug)]
pub enum Result {
    Void,
    Rows(Rows),
    SetKeyspace(SetKeyspace),
    Prepared(Prepared),
    SchemaChange(SchemaChange),
}

/// Result kinds, as sent in the first int of a RESULT body.
pub const RESULT_KIND_VOID: i32 = 0x0001;
pub const RESULT_KIND_ROWS: i32 = 0x0002;
pub const RESULT_KIND_SET_KEYSPACE: i32 = 0x0003;
pub const RESULT_KIND_PREPARED: i32 = 0x0004;
pub const RESULT_KIND_SCHEMA_CHANGE: i32 = 0x0005;

const FLAG_GLOBAL_TABLES_SPEC: i32 = 0x0001;

fn deser_type(buf: &mut &[u8]) -> std::result::Result<ColumnType, ParseError> {
    use ColumnType::*;
    let id = types::read_short(buf)?;
    Ok(match id {
        0x0000 => Custom(types::read_string(buf)?.to_owned()),
        0x0001 => Ascii,
        0x0002 => BigInt,
        0x0003 => Blob,
        0x0004 => Boolean,
        0x0005 => Counter,
        0x0006 => Decimal,
        0x0007 => Double,
        0x0008 => Float,
        0x0009 => Int,
        0x000A => Text,
        0x000B => Timestamp,
        0x000C => Uuid,
        0x000D => Varchar,
        0x000E => Varint,
        0x000F => Timeuuid,
        0x0010 => Inet,
        0x0020 => List(Box::new(deser_type(buf)?)),
        0x0021 => Map(Box::new(deser_type(buf)?), Box::new(deser_type(buf)?)),
        0x0022 => Set(Box::new(deser_type(buf)?)),
        id => {
            return Err(ParseError::TypeNotImplemented(id));
        }
    })
}

fn deser_table_spec(buf: &mut &[u8]) -> std::result::Result<TableSpec, ParseError> {
    let ks_name = types::read_string(buf)?.to_owned();
    let table_name = types::read_string(buf)?.to_owned();
    Ok(TableSpec {
        ks_name,
        table_name,
    })
}

fn deser_col_specs(
    buf: &mut &[u8],
    global_table_spec: &Option<TableSpec>,
    col_count: usize,
) -> std::result::Result<Vec<ColumnSpec>, ParseError> {
    // Every spec takes at least a name and a type id; don't trust a huge count.
    let mut col_specs = Vec::with_capacity(col_count.min(buf.len() / 4));
    for _ in 0..col_count {
        let table_spec = match global_table_spec {
            Some(spec) => spec.clone(),
            None => deser_table_spec(buf)?,
        };
        let name = types::read_string(buf)?.to_owned();
        let typ = deser_type(buf)?;
        col_specs.push(ColumnSpec {
            table_spec,
            name,
            typ,
        });
    }
    Ok(col_specs)
}

pub(crate) fn deser_result_metadata(
    buf: &mut &[u8],
) -> std::result::Result<ResultMetadata, ParseError> {
    let flags = types::read_int(buf)?;
    let col_count = types::read_int_length(buf)?;

    let global_table_spec = if flags & FLAG_GLOBAL_TABLES_SPEC != 0 {
        Some(deser_table_spec(buf)?)
    } else {
        None
    };

    let col_specs = deser_col_specs(buf, &global_table_spec, col_count)?;

    Ok(ResultMetadata {
        flags,
        col_count,
        global_table_spec,
        col_specs,
    })
}

fn deser_set_keyspace(buf: &mut &[u8]) -> std::result::Result<SetKeyspace, ParseError> {
    let keyspace_name = types::read_string(buf)?.to_string();

    Ok(SetKeyspace { keyspace_name })
}

fn deser_prepared(buf: &mut &[u8]) -> std::result::Result<Prepared, ParseError> {
    let id = Bytes::copy_from_slice(types::read_short_bytes(buf)?);
    let metadata = deser_result_metadata(buf)?;

    Ok(Prepared { id, metadata })
}

fn deser_schema_change(buf: &mut &[u8]) -> std::result::Result<SchemaChange, ParseError> {
    Ok(SchemaChange {
        change: types::read_string(buf)?.to_owned(),
        keyspace: types::read_string(buf)?.to_owned(),
        table: types::read_string(buf)?.to_owned(),
    })
}

pub fn deserialize(buf_bytes: Bytes) -> std::result::Result<Result, ParseError> {
    let buf = &mut &*buf_bytes;
    Ok(match types::read_int(buf)? {
        RESULT_KIND_VOID => Result::Void,
        RESULT_KIND_ROWS => Result::Rows(Rows::deserialize(buf_bytes.slice_ref(buf))?),
        RESULT_KIND_SET_KEYSPACE => Result::SetKeyspace(deser_set_keyspace(buf)?),
        RESULT_KIND_PREPARED => Result::Prepared(deser_prepared(buf)?),
        RESULT_KIND_SCHEMA_CHANGE => Result::SchemaChange(deser_schema_change(buf)?),
        kind => return Err(ParseError::UnknownResultKind(kind)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn option_types() {
        let buf = [
            0x00, 0x21, 0x00, 0x0d, 0x00, 0x09, // map<varchar, int>
            0x00, 0x00, 0x00, 0x03, b'f', b'o', b'o', // custom "foo"
            0x00, 0x22, 0x00, 0x22, 0x00, 0x01, // set<set<ascii>>
        ];
        let slice = &mut &buf[..];
        assert_eq!(
            deser_type(slice).unwrap(),
            ColumnType::Map(Box::new(ColumnType::Varchar), Box::new(ColumnType::Int))
        );
        assert_eq!(
            deser_type(slice).unwrap(),
            ColumnType::Custom("foo".to_string())
        );
        assert_eq!(
            deser_type(slice).unwrap(),
            ColumnType::Set(Box::new(ColumnType::Set(Box::new(ColumnType::Ascii))))
        );
        assert!(slice.is_empty());

        assert_matches!(
            deser_type(&mut &[0x00, 0x30][..]),
            Err(ParseError::TypeNotImplemented(0x30))
        );
    }

    #[test]
    fn void_set_keyspace_and_schema_change() {
        assert_matches!(
            deserialize(Bytes::from_static(&[0, 0, 0, 1])),
            Ok(Result::Void)
        );

        let mut buf = vec![0, 0, 0, 3];
        types::write_string("km", &mut buf).unwrap();
        assert_matches!(
            deserialize(buf.into()),
            Ok(Result::SetKeyspace(SetKeyspace { keyspace_name })) if keyspace_name == "km"
        );

        let mut buf = vec![0, 0, 0, 5];
        types::write_string("DROPPED", &mut buf).unwrap();
        types::write_string("km", &mut buf).unwrap();
        types::write_string("", &mut buf).unwrap();
        let Ok(Result::SchemaChange(change)) = deserialize(buf.into()) else {
            panic!("Expected a schema change");
        };
        assert_eq!(change.change, "DROPPED");
        assert_eq!(change.keyspace, "km");
        assert!(change.table.is_empty());

        assert_matches!(
            deserialize(Bytes::from_static(&[0, 0, 0, 9])),
            Err(ParseError::UnknownResultKind(9))
        );
    }

    #[test]
    fn prepared_without_global_spec() {
        let mut buf = vec![0, 0, 0, 4];
        types::write_short_bytes(&[0xca, 0xfe], &mut buf).unwrap();
        types::write_int(0, &mut buf); // flags
        types::write_int(1, &mut buf); // column count
        types::write_string("ks", &mut buf).unwrap();
        types::write_string("tab", &mut buf).unwrap();
        types::write_string("id", &mut buf).unwrap();
        types::write_short(0x0009, &mut buf);

        let Ok(Result::Prepared(prepared)) = deserialize(buf.into()) else {
            panic!("Expected a prepared result");
        };
        assert_eq!(&prepared.id[..], &[0xca, 0xfe]);
        assert_eq!(prepared.metadata.col_count, 1);
        assert_eq!(prepared.metadata.global_table_spec, None);
        assert_eq!(
            prepared.metadata.col_specs[0],
            ColumnSpec {
                table_spec: TableSpec {
                    ks_name: "ks".to_string(),
                    table_name: "tab".to_string(),
                },
                name: "id".to_string(),
                typ: ColumnType::Int,
            }
        );
    }

    #[test]
    fn truncated_metadata_is_an_error() {
        let mut buf = vec![0, 0, 0, 4];
        types::write_short_bytes(&[0xca, 0xfe], &mut buf).unwrap();
        types::write_int(1, &mut buf); // global spec flag
        types::write_int(100, &mut buf); // column count, no specs follow
        assert!(deserialize(buf.into()).is_err());
    }
}
