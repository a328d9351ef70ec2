//! Wire messages and the per-job store that deduplicates them.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::metric::Fields;

pub mod schema;
mod store;
pub use store::{CachedMessage, MessageStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceOp {
    RegisterSchema,
    New,
    Update,
    Delete,
}

/// Identifies the entity a message is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMeta {
    pub schema_id: String,
    pub namespace: String,
    pub name: String,
}

/// A message before encoding.
///
/// `data` holds raw JSON bytes and is kept as received, so that equality can be decided
/// on the base payload while the encoded form carries metric fields spliced in.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub op: ResourceOp,
    pub meta: Option<ResourceMeta>,
    pub data: Vec<u8>,
}

#[derive(Serialize)]
struct Wire<'a> {
    op: ResourceOp,
    #[serde(skip_serializing_if = "Option::is_none")]
    meta: Option<&'a ResourceMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Box<RawValue>>,
}

#[derive(Serialize)]
struct ExtrasBlock<'a> {
    extras: &'a Fields,
}

impl Message {
    pub fn register_schema(schema: Vec<u8>) -> Self {
        Self {
            op: ResourceOp::RegisterSchema,
            meta: None,
            data: schema,
        }
    }

    pub fn resource(op: ResourceOp, meta: ResourceMeta, data: Vec<u8>) -> Self {
        Self {
            op,
            meta: Some(meta),
            data,
        }
    }

    /// Encodes the message for the sink, with `extras` spliced into `data` when non-empty.
    pub fn encode(&self, extras: &Fields) -> Result<Vec<u8>, CodecError> {
        let data = if extras.is_empty() {
            self.data.clone()
        } else {
            splice_extras(&self.data, extras)?
        };
        let data = if data.is_empty() {
            None
        } else {
            let text = String::from_utf8(data).map_err(|_| CodecError::NotUtf8)?;
            Some(RawValue::from_string(text).map_err(CodecError::Json)?)
        };

        serde_json::to_vec(&Wire {
            op: self.op,
            meta: self.meta.as_ref(),
            data,
        })
        .map_err(CodecError::Json)
    }

    /// Semantic equality: same op and meta, and structurally identical non-empty payloads.
    pub fn same_as(&self, other: &Message) -> bool {
        if self.op != other.op
            || self.meta != other.meta
            || self.data.is_empty()
            || other.data.is_empty()
        {
            return false;
        }

        match (
            serde_json::from_slice::<serde_json::Value>(&self.data),
            serde_json::from_slice::<serde_json::Value>(&other.data),
        ) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

/// Appends `"extras": {...}` to the JSON object in `data` without reparsing it.
///
/// An empty payload or an empty object becomes `{"extras": {...}}`.
fn splice_extras(data: &[u8], extras: &Fields) -> Result<Vec<u8>, CodecError> {
    let block = serde_json::to_vec(&ExtrasBlock { extras }).map_err(CodecError::Json)?;

    let body = trim(data);
    if body.is_empty() || is_empty_object(body) {
        return Ok(block);
    }
    if body.first() != Some(&b'{') || body.last() != Some(&b'}') {
        return Err(CodecError::NotAnObject);
    }

    let mut out = Vec::with_capacity(body.len() + block.len());
    out.extend_from_slice(&body[..body.len() - 1]);
    out.push(b',');
    out.extend_from_slice(&block[1..]);
    Ok(out)
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

fn is_empty_object(body: &[u8]) -> bool {
    body.len() >= 2
        && body[0] == b'{'
        && body[body.len() - 1] == b'}'
        && body[1..body.len() - 1].iter().all(u8::is_ascii_whitespace)
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("serialize message: {0}")]
    Json(#[source] serde_json::Error),
    #[error("message data is not valid UTF-8")]
    NotUtf8,
    #[error("cannot merge extras into a payload that is not a JSON object")]
    NotAnObject,
}
