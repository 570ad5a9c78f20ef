use super::{ByteReader, Column};

pub const SCHEMA_MAGIC_NUM: u32 = 200_715;

/// Ordered set of columns describing one table or index key layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Schema { columns }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, index: usize) -> &Column {
        &self.columns[index]
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name() == name)
    }

    /// Project the named columns into a key schema for an index.
    pub fn project(&self, column_indexes: &[u32]) -> Schema {
        Schema {
            columns: column_indexes
                .iter()
                .map(|&i| self.columns[i as usize].clone())
                .collect(),
        }
    }

    pub fn serialized_size(&self) -> usize {
        4 + 4 + self
            .columns
            .iter()
            .map(Column::serialized_size)
            .sum::<usize>()
    }

    pub fn serialize_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&SCHEMA_MAGIC_NUM.to_le_bytes());
        buf.extend_from_slice(&(self.columns.len() as u32).to_le_bytes());
        for column in &self.columns {
            column.serialize_to(buf);
        }
    }

    pub(crate) fn deserialize_from(reader: &mut ByteReader) -> Self {
        let magic = reader.read_u32();
        assert_eq!(magic, SCHEMA_MAGIC_NUM, "invalid schema magic number");

        let count = reader.read_u32() as usize;
        let columns = (0..count)
            .map(|_| Column::deserialize_from(reader))
            .collect();
        Schema { columns }
    }
}
