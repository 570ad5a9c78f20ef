use super::{ByteReader, Field, RowId, Schema, INVALID_ROW_ID};

pub const ROW_MAGIC_NUM: u32 = 210_115;

/// A materialized tuple: the ordered fields of one table row plus the heap
/// position it was read from (or will be written to).
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    rid: RowId,
    fields: Vec<Field>,
}

impl Row {
    pub fn new(fields: Vec<Field>) -> Self {
        Row {
            rid: INVALID_ROW_ID,
            fields,
        }
    }

    pub fn with_rid(rid: RowId) -> Self {
        Row { rid, fields: vec![] }
    }

    pub fn rid(&self) -> RowId {
        self.rid
    }

    pub fn set_rid(&mut self, rid: RowId) {
        self.rid = rid;
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> &Field {
        &self.fields[index]
    }

    pub fn serialized_size(&self, schema: &Schema) -> usize {
        assert_eq!(schema.column_count(), self.fields.len());
        4 + 4 + 4 + self
            .fields
            .iter()
            .map(Field::serialized_size)
            .sum::<usize>()
    }

    pub fn serialize_to(&self, buf: &mut Vec<u8>, schema: &Schema) {
        assert_eq!(
            schema.column_count(),
            self.fields.len(),
            "fields do not match the schema's column count"
        );

        buf.extend_from_slice(&ROW_MAGIC_NUM.to_le_bytes());
        buf.extend_from_slice(&(self.fields.len() as u32).to_le_bytes());

        let mut null_bitmap: u32 = 0;
        for (i, field) in self.fields.iter().enumerate() {
            if field.is_null() {
                null_bitmap |= 1 << i;
            }
        }
        buf.extend_from_slice(&null_bitmap.to_le_bytes());

        for field in &self.fields {
            field.serialize_to(buf);
        }
    }

    pub fn deserialize_from(bytes: &[u8], schema: &Schema) -> Self {
        let mut reader = ByteReader::new(bytes);
        let magic = reader.read_u32();
        assert_eq!(magic, ROW_MAGIC_NUM, "invalid row magic number");

        let field_count = reader.read_u32() as usize;
        assert_eq!(field_count, schema.column_count());
        let null_bitmap = reader.read_u32();

        let fields = (0..field_count)
            .map(|i| {
                let is_null = null_bitmap & (1 << i) != 0;
                Field::deserialize_from(&mut reader, schema.column(i).type_id(), is_null)
            })
            .collect();

        Row {
            rid: INVALID_ROW_ID,
            fields,
        }
    }

    /// Project this row onto an index key schema by column name.
    pub fn key_from_row(&self, schema: &Schema, key_schema: &Schema) -> Row {
        let fields = key_schema
            .columns()
            .iter()
            .map(|column| {
                let index = schema
                    .column_index(column.name())
                    .expect("key column missing from table schema");
                self.fields[index].clone()
            })
            .collect();
        Row::new(fields)
    }
}
