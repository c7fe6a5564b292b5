//! Payload compression middleware.
//!
//! Values are sanitized, serialized to JSON, deflated and base64-encoded so the
//! stored form is plain text that any string-valued backend can hold.
//!
//! Sanitizing rules:
//! - entries named `bindTo` are dropped (they hold view handles, not data);
//! - `gene` objects carrying `gene_name` collapse to that name;
//! - `transcript` objects carrying `transcript_id` collapse to that id.
//!
//! Owned `serde_json::Value` trees cannot contain shared or cyclic references,
//! so the only structural guard needed is a nesting limit. Repeated `genotype`
//! sub-objects are kept as they are.

use base64::Engine;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::{Read, Write};

use crate::error::{CacheError, CacheResult};

/// Field that is never persisted.
pub const EXCLUDED_FIELD: &str = "bindTo";

/// Field allowed to repeat across a payload.
pub const REPEATABLE_FIELD: &str = "genotype";

/// Deepest nesting accepted; stays below serde_json's parse recursion limit.
pub const MAX_DEPTH: usize = 100;

/// A stored payload, either still in its compressed text form or decoded.
///
/// Untagged on the wire: compressed payloads are JSON strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Compressed(String),
    Decoded(Value),
}

impl Payload {
    /// Length used for size accounting (text length of the compressed form).
    pub fn stored_len(&self) -> usize {
        match self {
            Payload::Compressed(text) => text.len(),
            Payload::Decoded(value) => value.to_string().len(),
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Payload::Decoded(v) => Some(v),
            Payload::Compressed(_) => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Payload::Decoded(v) => Some(v),
            Payload::Compressed(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Compressed(t) => Some(t),
            Payload::Decoded(_) => None,
        }
    }
}

/// Compress a value into its stored text form.
///
/// Returns `Ok(None)` for `null` and the empty string: there is nothing to store.
pub fn compress(value: &Value) -> CacheResult<Option<String>> {
    if value.is_null() || value.as_str() == Some("") {
        return Ok(None);
    }
    let sanitized = sanitize(value, None, 0)?;
    let json = serde_json::to_vec(&sanitized).map_err(|e| CacheError::Compression {
        message: e.to_string(),
    })?;

    let io_err = |e: std::io::Error| CacheError::Compression {
        message: e.to_string(),
    };
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
    encoder.write_all(&json).map_err(io_err)?;
    let bytes = encoder.finish().map_err(io_err)?;
    Ok(Some(base64::engine::general_purpose::STANDARD.encode(bytes)))
}

/// Serialize then compress any `Serialize` value.
pub fn compress_serializable<T: Serialize + ?Sized>(value: &T) -> CacheResult<Option<String>> {
    let value = serde_json::to_value(value).map_err(|e| CacheError::Compression {
        message: e.to_string(),
    })?;
    compress(&value)
}

/// Decompress stored text. With `enabled == false` the text is passed through untouched.
pub fn decompress(text: &str, enabled: bool) -> CacheResult<Payload> {
    if !enabled || text.is_empty() {
        return Ok(Payload::Compressed(text.to_string()));
    }
    decode_text(text).map(Payload::Decoded)
}

/// Decode stored text into a value.
pub(crate) fn decode_text(text: &str) -> CacheResult<Value> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(text.trim())
        .map_err(|e| CacheError::decompression(None, e.to_string()))?;
    let mut json = String::new();
    DeflateDecoder::new(bytes.as_slice())
        .read_to_string(&mut json)
        .map_err(|e| CacheError::decompression(None, e.to_string()))?;
    serde_json::from_str(&json).map_err(|e| CacheError::decompression(None, e.to_string()))
}

fn sanitize(value: &Value, field: Option<&str>, depth: usize) -> CacheResult<Value> {
    if depth > MAX_DEPTH {
        return Err(CacheError::Compression {
            message: format!("value nests deeper than {MAX_DEPTH} levels"),
        });
    }
    match value {
        Value::Object(map) => {
            if let Some(reduced) = field.and_then(|f| reduce_reference(f, map)) {
                return Ok(reduced);
            }
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                if k == EXCLUDED_FIELD {
                    continue;
                }
                out.insert(k.clone(), sanitize(v, Some(k), depth + 1)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .map(|v| sanitize(v, None, depth + 1))
            .collect::<CacheResult<Vec<_>>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

/// Nested unit/variant objects are stored by identifier only.
fn reduce_reference(field: &str, map: &Map<String, Value>) -> Option<Value> {
    let id_field = match field {
        "gene" => "gene_name",
        "transcript" => "transcript_id",
        _ => return None,
    };
    map.get(id_field).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn roundtrip_plain_value() {
        let value = json!({
            "features": [{"start": 1, "end": 9, "genotype": {"zygosity": "HET"}}],
            "loadState": {"inheritance": true},
            "maxAlleleCount": 2
        });
        let text = compress(&value).unwrap().unwrap();
        assert!(!text.contains('{'), "stored form should not be raw JSON");
        assert_eq!(decompress(&text, true).unwrap(), Payload::Decoded(value));
    }

    #[test]
    fn strips_excluded_field_at_any_depth() {
        let value = json!({"bindTo": "#svg", "data": {"bindTo": 3, "x": 1}});
        let text = compress(&value).unwrap().unwrap();
        let decoded = decompress(&text, true).unwrap().into_value().unwrap();
        assert_eq!(decoded, json!({"data": {"x": 1}}));
    }

    #[test]
    fn reduces_gene_and_transcript_objects() {
        let value = json!({
            "gene": {"gene_name": "BRCA1", "chr": "chr17", "start": 43044295},
            "transcript": {"transcript_id": "ENST00000357654", "exons": [1, 2]},
            "geneCoverage": [{"gene": {"chr": "chr17"}}]
        });
        let text = compress(&value).unwrap().unwrap();
        let decoded = decompress(&text, true).unwrap().into_value().unwrap();
        assert_eq!(decoded["gene"], json!("BRCA1"));
        assert_eq!(decoded["transcript"], json!("ENST00000357654"));
        // no identifying field: kept as-is
        assert_eq!(decoded["geneCoverage"][0]["gene"], json!({"chr": "chr17"}));
    }

    #[test]
    fn repeated_genotype_objects_survive() {
        let gt = json!({"zygosity": "HOM", "alleles": "A/A"});
        let value = json!({"features": [{"genotype": gt.clone()}, {"genotype": gt.clone()}]});
        let text = compress(&value).unwrap().unwrap();
        let decoded = decompress(&text, true).unwrap().into_value().unwrap();
        assert_eq!(decoded["features"][1]["genotype"], gt);
    }

    #[test]
    fn nothing_to_store_for_null_or_empty() {
        assert_eq!(compress(&Value::Null).unwrap(), None);
        assert_eq!(compress(&json!("")).unwrap(), None);
    }

    #[test]
    fn passthrough_when_disabled() {
        let out = decompress("not-even-base64!!", false).unwrap();
        assert_eq!(out, Payload::Compressed("not-even-base64!!".into()));
        assert_eq!(out.stored_len(), 17);
    }

    #[test]
    fn malformed_input_is_decompression_error() {
        let err = decompress("%%%", true).unwrap_err();
        assert!(matches!(err, CacheError::Decompression { .. }));

        // valid base64, not deflate
        let err = decompress("aGVsbG8gd29ybGQ=", true).unwrap_err();
        assert!(matches!(err, CacheError::Decompression { .. }));
    }

    #[test]
    fn too_deep_is_compression_error() {
        let mut value = json!(1);
        for _ in 0..(MAX_DEPTH + 5) {
            value = json!([value]);
        }
        assert!(matches!(
            compress(&value),
            Err(CacheError::Compression { .. })
        ));
    }

    #[test]
    fn compress_serializable_matches_value_path() {
        #[derive(Serialize)]
        struct Summary {
            #[serde(rename = "geneName")]
            gene_name: &'static str,
            score: u32,
        }
        let text = compress_serializable(&Summary {
            gene_name: "TP53",
            score: 3,
        })
        .unwrap()
        .unwrap();
        let decoded = decompress(&text, true).unwrap().into_value().unwrap();
        assert_eq!(decoded, json!({"geneName": "TP53", "score": 3}));
    }

    fn json_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            ".{0,16}".prop_map(Value::String),
        ];
        // lowercase keys never collide with `bindTo` or the `*_name`/`*_id` reference fields
        leaf.prop_recursive(4, 48, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,8}", inner, 0..6)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn any_value_roundtrips(value in json_value()) {
            match compress(&value).unwrap() {
                Some(text) => prop_assert_eq!(decode_text(&text).unwrap(), value),
                None => prop_assert!(value.is_null() || value.as_str() == Some("")),
            }
        }
    }
}
