// shared/src/payload.rs

//! Serde helper for raw byte payloads.
//!
//! Valid UTF-8 is written as a JSON string so captured JSON-RPC traffic stays
//! readable; anything else falls back to an array of byte values. Both forms
//! deserialize back to the same bytes.

use serde::{Deserialize, Deserializer, Serializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum Repr {
    Text(String),
    Bytes(Vec<u8>),
}

pub fn serialize<S: Serializer>(data: &[u8], ser: S) -> Result<S::Ok, S::Error> {
    match std::str::from_utf8(data) {
        Ok(text) => ser.serialize_str(text),
        Err(_) => ser.collect_seq(data.iter()),
    }
}

pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
    Ok(match Repr::deserialize(de)? {
        Repr::Text(s) => s.into_bytes(),
        Repr::Bytes(b) => b,
    })
}
