use crate::sealed::{self, OpenError};

use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

/// Total length of an onion as seen by the server at `idx`.
///
/// Hops are counted from the exit end: the exit is 0, the entry is N-1.
/// Each hop peels one sealed-box layer, so the onion shrinks by
/// `sealed::OVERHEAD` per hop until the payload surfaces at the exit.
pub fn message_length(idx: usize, payload_len: usize) -> usize {
	payload_len + sealed::OVERHEAD * (idx + 1)
}

/// Error types for building onions
#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum WrapError {
	#[error("wrong message size: {found}!={expected}")]
	WrongPayloadLength { expected: usize, found: usize },
	#[error("cannot build an onion for an empty cascade")]
	NoKeys,
}

/// Build an onion for the cascade described by `pub_keys`.
///
/// `pub_keys` is reverse-indexed: `pub_keys[0]` is the exit and
/// `pub_keys[N-1]` is the entry. Sealing in ascending index order puts the
/// entry server's layer outermost, so the entry peels first.
pub fn wrap(pub_keys: &[PublicKey], payload_len: usize, payload: &[u8]) -> Result<Vec<u8>, WrapError> {
	if pub_keys.is_empty() {
		return Err(WrapError::NoKeys);
	}
	if payload.len() != payload_len {
		return Err(WrapError::WrongPayloadLength {
			expected: payload_len,
			found: payload.len(),
		});
	}

	let mut onion = payload.to_vec();
	for pk in pub_keys {
		onion = sealed::seal(pk, &onion);
	}
	Ok(onion)
}

/// Peel a single layer off an onion.
///
/// Failure reveals nothing about the cause; callers must treat it as a
/// silent drop.
pub fn peel(sk: &StaticSecret, pk: &PublicKey, onion: &[u8]) -> Result<Vec<u8>, OpenError> {
	sealed::open(sk, pk, onion)
}
