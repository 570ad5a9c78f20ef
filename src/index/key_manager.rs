use std::cmp::Ordering;

use crate::record::{Row, Schema, TypeId};

/// Encodes index keys into the fixed per-index `key_size` slot and compares
/// them by their decoded fields, so Int and Float keys order numerically
/// rather than bytewise.
#[derive(Clone)]
pub struct KeyManager {
    key_schema: Schema,
    key_size: usize,
}

impl KeyManager {
    pub fn new(key_schema: Schema) -> Self {
        // row framing plus the widest serialization of every column
        let payload: usize = key_schema
            .columns()
            .iter()
            .map(|c| match c.type_id() {
                TypeId::Int | TypeId::Float => 4,
                TypeId::Char => 4 + c.length() as usize,
            })
            .sum();
        let key_size = 12 + payload;
        KeyManager {
            key_schema,
            key_size,
        }
    }

    pub fn key_schema(&self) -> &Schema {
        &self.key_schema
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    /// Serialize a key row into exactly `key_size` bytes, zero-padded.
    pub fn encode(&self, key: &Row) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.key_size);
        key.serialize_to(&mut bytes, &self.key_schema);
        assert!(bytes.len() <= self.key_size, "key exceeds its fixed size");
        bytes.resize(self.key_size, 0);
        bytes
    }

    pub fn decode(&self, bytes: &[u8]) -> Row {
        Row::deserialize_from(bytes, &self.key_schema)
    }

    /// Field-by-field comparison of two encoded keys. A null field sorts
    /// below every value, which keeps keys over nullable columns totally
    /// ordered.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let row_a = self.decode(a);
        let row_b = self.decode(b);
        for (field_a, field_b) in row_a.fields().iter().zip(row_b.fields()) {
            let ord = match (field_a.is_null(), field_b.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => field_a
                    .partial_cmp(field_b)
                    .expect("mismatched field types in index key"),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}
