use crate::frame::frame_errors::{CellAccessError, ParseError};
use crate::frame::response::result::{deser_result_metadata, ColumnType, ResultMetadata};
use crate::frame::response::value::{CqlValueRef, ListView, MapView, SetView};
use crate::frame::types;
use bytes::Bytes;
use std::net::IpAddr;
use std::ops::Range;
use uuid::Uuid;

/// Location of one cell of the current row inside the rows buffer.
#[derive(Debug, Clone)]
enum Cell {
    /// Negative or zero length.
    Null,
    Value(Range<usize>),
    /// The declared length runs past the end of the body.
    Truncated { declared: usize, available: usize },
}

/// A forward-only cursor over the rows of a ROWS result.
///
/// Row data stays in the frame body; [`Rows::next`] only records where each
/// cell of the new current row lives, and accessors decode on demand.
#[derive(Debug)]
pub struct Rows {
    pub metadata: ResultMetadata,
    rows_count: usize,
    raw_rows: Bytes,
    cursor: usize,
    rows_read: usize,
    current: Option<Vec<Cell>>,
}

/// Something that selects a column: its position or its name.
pub trait ColumnIndex {
    fn resolve(&self, metadata: &ResultMetadata) -> Result<usize, CellAccessError>;
}

impl ColumnIndex for usize {
    fn resolve(&self, metadata: &ResultMetadata) -> Result<usize, CellAccessError> {
        if *self >= metadata.col_specs.len() {
            return Err(CellAccessError::ColumnIndexOutOfRange {
                index: *self,
                count: metadata.col_specs.len(),
            });
        }
        Ok(*self)
    }
}

impl ColumnIndex for &str {
    fn resolve(&self, metadata: &ResultMetadata) -> Result<usize, CellAccessError> {
        metadata
            .column_index(self)
            .ok_or_else(|| CellAccessError::NoSuchColumn(self.to_string()))
    }
}

impl Rows {
    pub(crate) fn deserialize(buf_bytes: Bytes) -> Result<Rows, ParseError> {
        let buf = &mut &*buf_bytes;
        let metadata = deser_result_metadata(buf)?;
        let rows_count = types::read_int_length(buf)?;
        let raw_rows = buf_bytes.slice_ref(buf);

        Ok(Rows {
            metadata,
            rows_count,
            raw_rows,
            cursor: 0,
            rows_read: 0,
            current: None,
        })
    }

    pub fn rows_count(&self) -> usize {
        self.rows_count
    }

    pub fn column_count(&self) -> usize {
        self.metadata.col_specs.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.metadata.column_index(name)
    }

    pub fn column_type(&self, column: impl ColumnIndex) -> Result<&ColumnType, CellAccessError> {
        let index = column.resolve(&self.metadata)?;
        Ok(&self.metadata.col_specs[index].typ)
    }

    /// Advances to the next row. Returns false once every row has been read.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> bool {
        if self.rows_read >= self.rows_count {
            self.current = None;
            return false;
        }

        let cells = (0..self.column_count())
            .map(|_| self.read_cell())
            .collect();
        self.current = Some(cells);
        self.rows_read += 1;
        true
    }

    fn read_cell(&mut self) -> Cell {
        let available = self.raw_rows.len() - self.cursor;
        let mut rest = &self.raw_rows[self.cursor..];
        let Ok(len) = types::read_int(&mut rest) else {
            self.cursor = self.raw_rows.len();
            return Cell::Truncated {
                declared: 4,
                available,
            };
        };
        self.cursor += 4;
        if len <= 0 {
            return Cell::Null;
        }

        let len = len as usize;
        let available = available - 4;
        if len > available {
            self.cursor = self.raw_rows.len();
            return Cell::Truncated {
                declared: len,
                available,
            };
        }
        let start = self.cursor;
        self.cursor += len;
        Cell::Value(start..self.cursor)
    }

    fn cell(&self, column: impl ColumnIndex) -> Result<(usize, &Cell), CellAccessError> {
        let index = column.resolve(&self.metadata)?;
        let row = self.current.as_ref().ok_or(CellAccessError::NoCurrentRow)?;
        Ok((index, &row[index]))
    }

    /// A truncated cell is not null; reading it reports the truncation.
    pub fn is_null(&self, column: impl ColumnIndex) -> Result<bool, CellAccessError> {
        let (_, cell) = self.cell(column)?;
        Ok(matches!(cell, Cell::Null))
    }

    pub fn get(&self, column: impl ColumnIndex) -> Result<CqlValueRef<'_>, CellAccessError> {
        let (index, cell) = self.cell(column)?;
        match cell {
            Cell::Null => Err(CellAccessError::Null { index }),
            Cell::Truncated {
                declared,
                available,
            } => Err(CellAccessError::Truncated {
                index,
                declared: *declared,
                available: *available,
            }),
            Cell::Value(range) => Ok(CqlValueRef::new(
                index,
                &self.metadata.col_specs[index].typ,
                &self.raw_rows[range.clone()],
                &self.raw_rows,
            )),
        }
    }

    /// The raw bytes of a cell, whatever its type.
    pub fn get_data(&self, column: impl ColumnIndex) -> Result<Bytes, CellAccessError> {
        Ok(self.get(column)?.as_bytes())
    }

    pub fn get_bool(&self, column: impl ColumnIndex) -> Result<bool, CellAccessError> {
        self.get(column)?.as_bool()
    }

    pub fn get_int(&self, column: impl ColumnIndex) -> Result<i32, CellAccessError> {
        self.get(column)?.as_int()
    }

    pub fn get_bigint(&self, column: impl ColumnIndex) -> Result<i64, CellAccessError> {
        self.get(column)?.as_bigint()
    }

    pub fn get_float(&self, column: impl ColumnIndex) -> Result<f32, CellAccessError> {
        self.get(column)?.as_float()
    }

    pub fn get_double(&self, column: impl ColumnIndex) -> Result<f64, CellAccessError> {
        self.get(column)?.as_double()
    }

    pub fn get_string(&self, column: impl ColumnIndex) -> Result<&str, CellAccessError> {
        self.get(column)?.as_str()
    }

    pub fn get_uuid(&self, column: impl ColumnIndex) -> Result<Uuid, CellAccessError> {
        self.get(column)?.as_uuid()
    }

    pub fn get_inet(&self, column: impl ColumnIndex) -> Result<IpAddr, CellAccessError> {
        self.get(column)?.as_inet()
    }

    pub fn get_list(&self, column: impl ColumnIndex) -> Result<ListView, CellAccessError> {
        self.get(column)?.as_list()
    }

    pub fn get_set(&self, column: impl ColumnIndex) -> Result<SetView, CellAccessError> {
        self.get(column)?.as_set()
    }

    pub fn get_map(&self, column: impl ColumnIndex) -> Result<MapView, CellAccessError> {
        self.get(column)?.as_map()
    }
}
