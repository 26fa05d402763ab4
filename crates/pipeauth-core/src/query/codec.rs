//! Binary codec: `"PQ"` magic, version byte, u32 LE body length, then an
//! rkyv archive validated on read.

use rkyv::{AlignedVec, Archive, Deserialize, Serialize};

use super::{Envelope, Part, Query, QueryError};

/// Magic bytes opening every encoded query.
pub const MAGIC: [u8; 2] = *b"PQ";
/// Current codec version.
pub const VERSION: u8 = 1;
/// Magic + version + body length.
pub const HEADER_LEN: usize = 7;

#[derive(Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
struct WirePart {
    name: String,
    value: Option<String>,
}

#[derive(Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
struct WireEnvelope {
    operator: String,
    encrypted_key: Vec<u8>,
    ciphertext: Vec<u8>,
}

#[derive(Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
struct WireQuery {
    parts: Vec<WirePart>,
    envelope: Option<WireEnvelope>,
}

impl From<&Query> for WireQuery {
    fn from(query: &Query) -> Self {
        Self {
            parts: query
                .parts
                .iter()
                .map(|p| WirePart {
                    name: p.name.clone(),
                    value: p.value.clone(),
                })
                .collect(),
            envelope: query.envelope.as_ref().map(|e| WireEnvelope {
                operator: e.operator.clone(),
                encrypted_key: e.encrypted_key.clone(),
                ciphertext: e.ciphertext.clone(),
            }),
        }
    }
}

impl From<WireQuery> for Query {
    fn from(wire: WireQuery) -> Self {
        Self {
            parts: wire
                .parts
                .into_iter()
                .map(|p| Part {
                    name: p.name,
                    value: p.value,
                })
                .collect(),
            envelope: wire.envelope.map(|e| Envelope {
                operator: e.operator,
                encrypted_key: e.encrypted_key,
                ciphertext: e.ciphertext,
            }),
        }
    }
}

pub(super) fn encode(query: &Query) -> Result<Vec<u8>, QueryError> {
    let body = rkyv::to_bytes::<_, 256>(&WireQuery::from(query))
        .map_err(|e| QueryError::Encode(e.to_string()))?;
    let body_len = u32::try_from(body.len())
        .map_err(|_| QueryError::Encode(format!("body too large: {} bytes", body.len())))?;

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&MAGIC);
    out.push(VERSION);
    out.extend_from_slice(&body_len.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

pub(super) fn decode(bytes: &[u8]) -> Result<Query, QueryError> {
    if bytes.len() < HEADER_LEN {
        return Err(QueryError::Malformed(format!(
            "truncated header: {} bytes",
            bytes.len()
        )));
    }
    if bytes[..2] != MAGIC {
        return Err(QueryError::Malformed("bad magic".to_string()));
    }
    if bytes[2] != VERSION {
        return Err(QueryError::Malformed(format!(
            "unsupported version {}",
            bytes[2]
        )));
    }

    let declared = u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]) as usize;
    let body = &bytes[HEADER_LEN..];
    if body.len() != declared {
        return Err(QueryError::Malformed(format!(
            "length mismatch: header says {declared}, got {}",
            body.len()
        )));
    }

    // Archives must be read from an aligned buffer.
    let mut aligned = AlignedVec::with_capacity(body.len());
    aligned.extend_from_slice(body);

    let wire = rkyv::from_bytes::<WireQuery>(&aligned)
        .map_err(|e| QueryError::Malformed(e.to_string()))?;
    Ok(wire.into())
}
