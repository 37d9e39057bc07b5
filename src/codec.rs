//! Canonical event encoding and identity verification.

use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::event::{Event, Tag};

/// Event as it appears on the wire, before range and shape checks.
///
/// `kind` is read as a 64-bit integer so that out-of-range values produce
/// [`Error::InvalidKind`] instead of an opaque parse failure.
#[derive(Debug, Deserialize)]
pub struct RawEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u64,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl TryFrom<RawEvent> for Event {
    type Error = Error;

    fn try_from(raw: RawEvent) -> Result<Self> {
        let kind = u16::try_from(raw.kind).map_err(|_| Error::InvalidKind(raw.kind))?;
        if let Some(pos) = raw.tags.iter().position(Vec::is_empty) {
            return Err(Error::MalformedTag(pos));
        }
        Ok(Event {
            id: raw.id,
            pubkey: raw.pubkey,
            created_at: raw.created_at,
            kind,
            tags: raw.tags.into_iter().map(Tag).collect(),
            content: raw.content,
            sig: raw.sig,
        })
    }
}

/// Decode an event from JSON bytes.
///
/// Range and shape violations keep their specific error variant rather than
/// being folded into [`Error::Decode`].
pub fn decode(data: &[u8]) -> Result<Event> {
    let raw: RawEvent = serde_json::from_slice(data)?;
    Event::try_from(raw)
}

/// Encode an event as compact JSON.
pub fn encode(ev: &Event) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(ev)?)
}

/// Canonical NIP-01 serialization: `[0, pubkey, created_at, kind, tags, content]`.
pub fn canonical_bytes(ev: &Event) -> Result<Vec<u8>> {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    Ok(serde_json::to_vec(&arr)?)
}

/// Recompute the Nostr event hash from its fields.
pub fn event_hash(ev: &Event) -> Result<[u8; 32]> {
    let data = canonical_bytes(ev)?;
    Ok(Sha256::digest(&data).into())
}

/// Check an event's shape, id and (optionally) signature.
///
/// Side-effect free. The id is always recomputed; `verify_sig` controls the
/// Schnorr check.
pub fn validate(ev: &Event, verify_sig: bool) -> Result<()> {
    if let Some(pos) = ev.tags.iter().position(|t| t.0.is_empty()) {
        return Err(Error::MalformedTag(pos));
    }
    if !is_hex32(&ev.pubkey) {
        return Err(Error::InvalidPubkey(format!(
            "expected 64 lowercase hex characters, got {:?}",
            ev.pubkey
        )));
    }
    let hash = event_hash(ev)?;
    let calc_id = hex::encode(hash);
    if calc_id != ev.id {
        return Err(Error::InvalidId(format!("expected {calc_id}, got {}", ev.id)));
    }
    if verify_sig {
        verify_signature(ev, &hash)?;
    }
    Ok(())
}

/// Whether `s` is 64 lowercase hex characters, the shape of ids and pubkeys.
pub fn is_hex32(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn verify_signature(ev: &Event, hash: &[u8; 32]) -> Result<()> {
    let sig_bytes =
        hex::decode(&ev.sig).map_err(|e| Error::InvalidSignature(format!("sig: {e}")))?;
    let sig = Signature::from_slice(&sig_bytes)
        .map_err(|e| Error::InvalidSignature(format!("sig: {e}")))?;
    let pk_bytes =
        hex::decode(&ev.pubkey).map_err(|e| Error::InvalidPubkey(e.to_string()))?;
    let pk = XOnlyPublicKey::from_slice(&pk_bytes).map_err(|e| Error::InvalidPubkey(e.to_string()))?;
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest(*hash);
    secp.verify_schnorr(&sig, &msg, &pk)
        .map_err(|e| Error::InvalidSignature(e.to_string()))
}
