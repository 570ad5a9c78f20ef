use std::cmp::Ordering;

use super::{ByteReader, TypeId};

/// One column value of a row. Null carries no payload bytes; the row's
/// null bitmap is what distinguishes it on disk.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Int(i32),
    Float(f32),
    Char(String),
    Null,
}

impl Field {
    pub fn is_null(&self) -> bool {
        matches!(self, Field::Null)
    }

    pub fn type_id(&self) -> Option<TypeId> {
        match self {
            Field::Int(_) => Some(TypeId::Int),
            Field::Float(_) => Some(TypeId::Float),
            Field::Char(_) => Some(TypeId::Char),
            Field::Null => None,
        }
    }

    pub fn serialized_size(&self) -> usize {
        match self {
            Field::Int(_) | Field::Float(_) => 4,
            Field::Char(s) => 4 + s.len(),
            Field::Null => 0,
        }
    }

    pub fn serialize_to(&self, buf: &mut Vec<u8>) {
        match self {
            Field::Int(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Field::Float(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Field::Char(s) => {
                buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            Field::Null => {}
        }
    }

    pub(crate) fn deserialize_from(reader: &mut ByteReader, type_id: TypeId, is_null: bool) -> Self {
        if is_null {
            return Field::Null;
        }
        match type_id {
            TypeId::Int => Field::Int(reader.read_i32()),
            TypeId::Float => Field::Float(reader.read_f32()),
            TypeId::Char => {
                let len = reader.read_u32() as usize;
                Field::Char(String::from_utf8(reader.read_bytes(len).to_vec()).unwrap())
            }
        }
    }
}

impl PartialOrd for Field {
    /// Same-type comparison only; nulls and mixed types are unordered.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Field::Int(a), Field::Int(b)) => a.partial_cmp(b),
            (Field::Float(a), Field::Float(b)) => a.partial_cmp(b),
            (Field::Char(a), Field::Char(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for field in [
            Field::Int(-42),
            Field::Float(2.5),
            Field::Char("minirel".to_string()),
        ] {
            let mut buf = vec![];
            field.serialize_to(&mut buf);
            assert_eq!(buf.len(), field.serialized_size());

            let mut reader = ByteReader::new(&buf);
            let back = Field::deserialize_from(&mut reader, field.type_id().unwrap(), false);
            assert_eq!(back, field);
        }
    }

    #[test]
    fn test_null_occupies_no_bytes() {
        let mut buf = vec![];
        Field::Null.serialize_to(&mut buf);
        assert!(buf.is_empty());

        let mut reader = ByteReader::new(&buf);
        assert_eq!(
            Field::deserialize_from(&mut reader, TypeId::Int, true),
            Field::Null
        );
    }

    #[test]
    fn test_ordering() {
        assert!(Field::Int(1) < Field::Int(2));
        assert!(Field::Char("a".into()) < Field::Char("b".into()));
        assert!(Field::Int(1).partial_cmp(&Field::Float(1.0)).is_none());
        assert!(Field::Null.partial_cmp(&Field::Null).is_none());
    }
}
