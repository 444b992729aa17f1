//! A [Canonical JSON] formatter that escapes control characters. This
//! differs to the olpc-cjson standard.
//!
//! The [`olpc-cjson`] crate itself states:
//!
//! > OLPC’s canonical JSON specification is subtly different from
//! > other “canonical JSON” specifications, and is also not a strict
//! > subset of JSON (specifically, ASCII control characters 0x00–0x1f
//! > are printed literally, which is not valid JSON). Therefore,
//! > serde_json cannot necessarily deserialize JSON produced by this
//! > formatter.
//!
//! All signing and verification in this crate routes through
//! [`encode`]; there is exactly one definition of canonical form.
//!
//! [Canonical JSON]: http://wiki.laptop.org/go/Canonical_JSON
//! [olpc-json]: https://docs.rs/olpc-cjson/0.1.2/olpc_cjson

pub mod formatter;

use serde::Serialize;

pub use formatter::CanonicalFormatter;

/// Serialize a value as canonical JSON.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, CanonicalFormatter::new());

    value.serialize(&mut serializer)?;

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_keys() {
        let value = serde_json::json!({ "b": 1, "a": { "d": 2, "c": 3 } });
        let encoded = encode(&value).unwrap();

        assert_eq!(encoded, br#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    #[test]
    fn test_floats_rejected() {
        let value = serde_json::json!({ "x": 1.5 });
        assert!(encode(&value).is_err());
    }

    #[test]
    fn test_reparse() {
        let value = serde_json::json!({ "esc": "a\tb", "n": -1 });
        let encoded = encode(&value).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(parsed, value);
    }
}
