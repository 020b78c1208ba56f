//! Column metadata and decoded result rows
use std::sync::Arc;

use crate::error::{At, Result};
use crate::packet::{PacketReader, null_bitmap_is_set, null_bitmap_width};
use crate::value::Value;

/// Metadata of one result-set or parameter column
#[derive(Clone, Debug)]
pub struct Column {
    /// The column alias the query selected it under
    pub name: String,
    /// The field type, see [crate::constants::type_]
    pub(crate) type_: u8,
    /// Column detail flags, see [crate::constants::column_flag]
    pub(crate) flags: u16,
    /// Collation id; 63 marks binary data
    pub(crate) character_set: u16,
}

/// Parse a column-definition packet.
///
/// Layout: length-encoded catalog, schema, table alias, table, column
/// alias, column; a fixed length-encoded 0x0C; charset, length, type,
/// flags, decimals and two filler bytes.
pub(crate) fn parse_column_definition(r: &mut PacketReader<'_>) -> Result<Column> {
    r.skip_lenenc_str().at("catalog")?;
    r.skip_lenenc_str().at("schema")?;
    r.skip_lenenc_str().at("table alias")?;
    r.skip_lenenc_str().at("table")?;
    let name = r.get_lenenc_str().at("column alias")?.to_string();
    r.skip_lenenc_str().at("column")?;
    r.expect_u8("fixed fields length", 0x0C)
        .at("fixed fields length")?;
    let character_set = r.get_u16().at("character set")?;
    let _length = r.get_u32().at("column length")?;
    let type_ = r.get_u8().at("column type")?;
    let flags = r.get_u16().at("column flags")?;
    let _decimals = r.get_u8().at("decimals")?;
    r.get_u16().at("filler")?;
    Ok(Column {
        name,
        type_,
        flags,
        character_set,
    })
}

/// One decoded row of a result set
#[derive(Clone, Debug)]
pub struct Row {
    /// Columns of the result set this row belongs to
    columns: Arc<[Column]>,
    /// One value per column, in column order
    values: Vec<Value>,
}

impl Row {
    /// Decode a binary-protocol row packet: a 0x00 tag, the NULL bitmap
    /// with its two-bit offset, then a value per non-NULL column.
    pub(crate) fn parse_binary(columns: &Arc<[Column]>, payload: &[u8]) -> Result<Row> {
        let mut r = PacketReader::new(payload);
        r.expect_u8("row tag", 0x00).at("row tag")?;
        let bitmap = r
            .get_bytes(null_bitmap_width(columns.len()))
            .at("null bitmap")?;
        let mut values = Vec::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            if null_bitmap_is_set(bitmap, i) {
                values.push(Value::Null);
            } else {
                values.push(Value::decode_binary(&mut r, column).at("row value")?);
            }
        }
        Ok(Row {
            columns: columns.clone(),
            values,
        })
    }

    /// The columns of the result set
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// The value of the column with the given alias
    pub fn get(&self, alias: &str) -> Option<&Value> {
        let index = self.columns.iter().position(|c| c.name == alias)?;
        self.values.get(index)
    }

    /// The value at the given 0-based column index
    pub fn value(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// All values in column order
    pub fn values(&self) -> &[Value] {
        &self.values
    }
}
