use serde::{Deserialize, Serialize};

use crate::encoding::{Decoded, DictRef};

/// Index kinds the store maintains. Only definitions and naive entry
/// maintenance live here; query planning is a different layer entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
    Value,
    FullText,
}

/// A persisted index definition: a name, a kind, and the key paths
/// (dot-separated) whose values feed the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub index_type: IndexType,
    pub expressions: Vec<String>,
}

/// Compute the index-entry keys a record body contributes to `def`.
/// Entry layout: `<name>:v:<hex(encoded value)>:<doc_id>` for value indexes,
/// `<name>:t:<term>:<doc_id>` for full-text. Removal deletes exactly the
/// keys the old body produced, so no reverse mapping is stored.
pub fn entries_for(def: &IndexDefinition, root: &DictRef, doc_id: &str) -> Vec<Vec<u8>> {
    let mut entries = Vec::new();
    for path in &def.expressions {
        let Some(value) = extract_path(root, path) else {
            continue;
        };
        match def.index_type {
            IndexType::Value => {
                let encoded = hex::encode(encode_key(&value));
                entries.push(format!("{}:v:{}:{}", def.name, encoded, doc_id).into_bytes());
            }
            IndexType::FullText => {
                if let Decoded::String(text) = &value {
                    for term in tokenize(text) {
                        entries.push(format!("{}:t:{}:{}", def.name, term, doc_id).into_bytes());
                    }
                }
            }
        }
    }
    entries
}

/// Follow a dot-separated key path into an encoded dict.
fn extract_path(root: &DictRef, path: &str) -> Option<Decoded> {
    let mut current = Decoded::Dict(root.clone());
    for segment in path.split('.') {
        match current {
            Decoded::Dict(dict) => current = dict.get(segment)?,
            _ => return None,
        }
    }
    Some(current)
}

/// Encode a decoded leaf into a binary-comparable key.
/// Preserves sort order: Null < Bool < Number < String.
fn encode_key(value: &Decoded) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    match value {
        Decoded::Null => key.push(0x01),
        Decoded::Bool(b) => {
            key.push(0x02);
            key.push(*b as u8);
        }
        Decoded::Int(_) | Decoded::Float(_) | Decoded::Double(_) => {
            key.push(0x03);
            key.extend_from_slice(&encode_f64(value.as_f64()));
        }
        Decoded::String(s) => {
            key.push(0x04);
            key.extend_from_slice(s.as_bytes());
            key.push(0x00);
        }
        Decoded::Dict(_) | Decoded::Array(_) => {
            // Containers are not useful sort keys; bucket them together.
            key.push(0x05);
        }
    }
    key
}

/// Encode f64 to binary-comparable bytes.
fn encode_f64(val: f64) -> [u8; 8] {
    let mut bits = val.to_bits();
    if bits & 0x8000_0000_0000_0000 != 0 {
        bits = !bits;
    } else {
        bits ^= 0x8000_0000_0000_0000;
    }
    bits.to_be_bytes()
}

/// Lower-cased alphanumeric terms, three characters or longer.
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(str::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_key_preserves_number_order() {
        let neg = encode_key(&Decoded::Double(-2.5));
        let zero = encode_key(&Decoded::Int(0));
        let pos = encode_key(&Decoded::Double(10.25));
        assert!(neg < zero);
        assert!(zero < pos);
    }

    #[test]
    fn test_encode_key_type_ordering() {
        let null = encode_key(&Decoded::Null);
        let boolean = encode_key(&Decoded::Bool(true));
        let number = encode_key(&Decoded::Int(5));
        let string = encode_key(&Decoded::String("a".to_string()));
        assert!(null < boolean);
        assert!(boolean < number);
        assert!(number < string);
    }

    #[test]
    fn test_tokenize() {
        let terms = tokenize("The quick, brown fox! at #42nd st");
        assert_eq!(terms, vec!["the", "quick", "brown", "fox", "42nd"]);
    }
}
