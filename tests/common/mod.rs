#![allow(dead_code)]

use hamerkop::{codec, Event, Tag};
use secp256k1::{Keypair, Message, Secp256k1};

/// Build an event signed with the secret key `[seed; 32]`.
pub fn signed(seed: u8, kind: u16, created_at: u64, tags: &[&[&str]], content: &str) -> Event {
    let secp = Secp256k1::new();
    let kp = Keypair::from_seckey_slice(&secp, &[seed; 32]).unwrap();
    let mut ev = Event {
        id: String::new(),
        pubkey: hex::encode(kp.x_only_public_key().0.serialize()),
        created_at,
        kind,
        tags: tags
            .iter()
            .map(|t| Tag(t.iter().map(|s| s.to_string()).collect()))
            .collect(),
        content: content.into(),
        sig: String::new(),
    };
    let hash = codec::event_hash(&ev).unwrap();
    ev.id = hex::encode(hash);
    let sig = secp.sign_schnorr_no_aux_rand(&Message::from_digest(hash), &kp);
    ev.sig = hex::encode(sig.as_ref());
    ev
}

pub fn pubkey(seed: u8) -> String {
    signed(seed, 1, 0, &[], "").pubkey
}

pub fn ids(events: impl IntoIterator<Item = std::sync::Arc<Event>>) -> Vec<String> {
    events.into_iter().map(|e| e.id.clone()).collect()
}
