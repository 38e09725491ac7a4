//! Message body → [`DecodedRecord`].
//!
//! Wire format is a JSON object carrying a string `content` and an integer
//! `message_number` (`sequence_number` is accepted as an alias). Every
//! decoder maps malformed bodies to a [`DecodeError`] and produces the same
//! record for the same valid body.

use std::borrow::Cow;
use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use ingest_api::DecodedRecord;

use crate::config::DecodeMethod;
use crate::error::DecodeError;

pub const CONTENT_FIELD: &str = "content";
pub const SEQUENCE_FIELD: &str = "message_number";
pub const SEQUENCE_ALIAS: &str = "sequence_number";

type DecodeFn = fn(&[u8]) -> Result<DecodedRecord, DecodeError>;

/// Decoders that `DecodeMethod::All` cross-checks, reference first.
const CROSS_CHECKED: [(DecodeMethod, DecodeFn); 3] = [
    (DecodeMethod::Value, decode_value),
    (DecodeMethod::Typed, decode_typed),
    (DecodeMethod::Borrowed, decode_borrowed),
];

/// Decoder selected once at startup.
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
    decode_fn: DecodeFn,
}

impl Decoder {
    pub fn new(method: DecodeMethod) -> Self {
        let decode_fn: DecodeFn = match method {
            DecodeMethod::Value => decode_value,
            DecodeMethod::Typed => decode_typed,
            DecodeMethod::Borrowed => decode_borrowed,
            DecodeMethod::All => decode_all,
        };
        Self { decode_fn }
    }

    pub fn decode(&self, body: &[u8]) -> Result<DecodedRecord, DecodeError> {
        (self.decode_fn)(body)
    }
}

/// UTF-8 check plus a cheap guard against non-object documents, which
/// serde would otherwise happily read into a struct from a JSON array.
fn object_text(body: &[u8]) -> Result<&str, DecodeError> {
    let text = std::str::from_utf8(body)?;
    if !text.trim_start().starts_with('{') {
        return Err(DecodeError::NotAnObject);
    }
    Ok(text)
}

/// Top-level JSON object that refuses a repeated `content` or sequence key
/// (alias included), matching what the derived decoders accept.
struct StrictObject(Map<String, Value>);

impl<'de> Deserialize<'de> for StrictObject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ObjectVisitor;

        impl<'de> Visitor<'de> for ObjectVisitor {
            type Value = StrictObject;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<StrictObject, A::Error> {
                let mut object = Map::new();
                while let Some((key, value)) = access.next_entry::<String, Value>()? {
                    // Unknown keys may repeat, the derived structs ignore them too.
                    let clash = match key.as_str() {
                        CONTENT_FIELD => object.contains_key(CONTENT_FIELD).then_some(CONTENT_FIELD),
                        SEQUENCE_FIELD | SEQUENCE_ALIAS => (object.contains_key(SEQUENCE_FIELD)
                            || object.contains_key(SEQUENCE_ALIAS))
                        .then_some(SEQUENCE_FIELD),
                        _ => None,
                    };
                    if let Some(field) = clash {
                        return Err(de::Error::custom(format_args!("duplicate field `{field}`")));
                    }
                    object.insert(key, value);
                }
                Ok(StrictObject(object))
            }
        }

        deserializer.deserialize_map(ObjectVisitor)
    }
}

fn decode_value(body: &[u8]) -> Result<DecodedRecord, DecodeError> {
    let StrictObject(object) = serde_json::from_str(object_text(body)?)?;

    let content = match object.get(CONTENT_FIELD) {
        None | Some(Value::Null) => return Err(DecodeError::MissingField(CONTENT_FIELD)),
        Some(Value::String(s)) => s.clone(),
        Some(_) => {
            return Err(DecodeError::InvalidField {
                field: CONTENT_FIELD,
                expected: "a string",
            });
        }
    };

    let sequence = object
        .get(SEQUENCE_FIELD)
        .or_else(|| object.get(SEQUENCE_ALIAS))
        .filter(|v| !v.is_null())
        .ok_or(DecodeError::MissingField(SEQUENCE_FIELD))?;
    let sequence_number = sequence.as_i64().ok_or(DecodeError::InvalidField {
        field: SEQUENCE_FIELD,
        expected: "a 64-bit integer",
    })?;

    Ok(DecodedRecord {
        content,
        sequence_number,
    })
}

#[derive(Deserialize)]
struct WireMessage {
    content: Option<String>,
    #[serde(alias = "sequence_number")]
    message_number: Option<i64>,
}

fn decode_typed(body: &[u8]) -> Result<DecodedRecord, DecodeError> {
    let msg: WireMessage = serde_json::from_str(object_text(body)?)?;
    Ok(DecodedRecord {
        content: msg.content.ok_or(DecodeError::MissingField(CONTENT_FIELD))?,
        sequence_number: msg
            .message_number
            .ok_or(DecodeError::MissingField(SEQUENCE_FIELD))?,
    })
}

#[derive(Deserialize)]
struct WireMessageRef<'a> {
    #[serde(borrow)]
    content: Option<Cow<'a, str>>,
    #[serde(alias = "sequence_number")]
    message_number: Option<i64>,
}

fn decode_borrowed(body: &[u8]) -> Result<DecodedRecord, DecodeError> {
    let msg: WireMessageRef<'_> = serde_json::from_str(object_text(body)?)?;
    Ok(DecodedRecord {
        content: msg
            .content
            .ok_or(DecodeError::MissingField(CONTENT_FIELD))?
            .into_owned(),
        sequence_number: msg
            .message_number
            .ok_or(DecodeError::MissingField(SEQUENCE_FIELD))?,
    })
}

fn decode_all(body: &[u8]) -> Result<DecodedRecord, DecodeError> {
    let (reference, reference_fn) = CROSS_CHECKED[0];
    let expected = reference_fn(body)?;
    for (method, decode_fn) in &CROSS_CHECKED[1..] {
        let got = decode_fn(body)?;
        if got != expected {
            return Err(DecodeError::Disagreement {
                method: *method,
                got,
                reference,
                expected,
            });
        }
    }
    Ok(expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    const METHODS: [DecodeMethod; 4] = [
        DecodeMethod::Value,
        DecodeMethod::Typed,
        DecodeMethod::Borrowed,
        DecodeMethod::All,
    ];

    fn decode_with_all(body: &str) -> Vec<Result<DecodedRecord, DecodeError>> {
        METHODS
            .iter()
            .map(|m| Decoder::new(*m).decode(body.as_bytes()))
            .collect()
    }

    #[test]
    fn decoders_agree_on_valid_bodies() {
        let cases = [
            (r#"{"content":"a","message_number":1}"#, DecodedRecord::new("a", 1)),
            (
                r#"{"message_number": 42, "content": "Message number 42"}"#,
                DecodedRecord::new("Message number 42", 42),
            ),
            (r#"  {"content":"esc\"aped\n","message_number":-3}"#, DecodedRecord::new("esc\"aped\n", -3)),
            (r#"{"content":"ünïcødé ✓","message_number":9223372036854775807}"#, DecodedRecord::new("ünïcødé ✓", i64::MAX)),
            (r#"{"content":"","sequence_number":0}"#, DecodedRecord::new("", 0)),
            (r#"{"content":"x","message_number":5,"extra":[1,2,{"k":null}]}"#, DecodedRecord::new("x", 5)),
        ];

        for (body, expected) in cases {
            for (method, result) in METHODS.iter().zip(decode_with_all(body)) {
                let record = result.unwrap_or_else(|e| panic!("{method} failed on {body}: {e}"));
                assert_eq!(record, expected, "{method} on {body}");
            }
        }
    }

    #[test]
    fn missing_fields_are_typed_errors() {
        for result in decode_with_all(r#"{"message_number":1}"#) {
            assert!(matches!(result, Err(DecodeError::MissingField(CONTENT_FIELD))), "{result:?}");
        }
        for result in decode_with_all(r#"{"content":"a","message_number":null}"#) {
            assert!(matches!(result, Err(DecodeError::MissingField(SEQUENCE_FIELD))), "{result:?}");
        }
    }

    #[test]
    fn malformed_bodies_are_rejected_by_every_decoder() {
        let bodies: [&[u8]; 6] = [
            b"not json",
            b"[\"a\", 1]",
            b"{\"content\":\"a\",\"message_number\":",
            b"{\"content\":7,\"message_number\":1}",
            b"{\"content\":\"a\",\"message_number\":1.5}",
            b"\xff\xfe{}",
        ];
        for body in bodies {
            for method in METHODS {
                let result = Decoder::new(method).decode(body);
                assert!(result.is_err(), "{method} accepted {:?}", String::from_utf8_lossy(body));
            }
        }
    }

    #[test]
    fn error_variants_are_specific() {
        let decoder = Decoder::new(DecodeMethod::Value);
        assert!(matches!(decoder.decode(b"\xff"), Err(DecodeError::Utf8(_))));
        assert!(matches!(decoder.decode(b"[1]"), Err(DecodeError::NotAnObject)));
        assert!(matches!(decoder.decode(b"{"), Err(DecodeError::Json(_))));
        assert!(matches!(
            decoder.decode(br#"{"content":"a","message_number":"1"}"#),
            Err(DecodeError::InvalidField { field: SEQUENCE_FIELD, .. })
        ));
    }

    #[test]
    fn repeated_and_aliased_keys_are_rejected_by_every_decoder() {
        let bodies = [
            r#"{"content":"a","message_number":1,"sequence_number":2}"#,
            r#"{"content":"a","sequence_number":2,"message_number":1}"#,
            r#"{"content":"a","content":"b","message_number":1}"#,
            r#"{"content":"a","message_number":1,"message_number":2}"#,
        ];
        let repeated_unknown = r#"{"content":"a","note":1,"note":2,"message_number":3}"#;
        for (method, result) in METHODS.iter().zip(decode_with_all(repeated_unknown)) {
            assert_eq!(result.unwrap_or_else(|e| panic!("{method}: {e}")), DecodedRecord::new("a", 3));
        }

        for body in bodies {
            for (method, result) in METHODS.iter().zip(decode_with_all(body)) {
                match result {
                    Err(DecodeError::Json(e)) => {
                        assert!(e.to_string().contains("duplicate field"), "{method} on {body}: {e}")
                    }
                    other => panic!("{method} on {body}: {other:?}"),
                }
            }
        }
    }
}
