use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

/// Sealed-box overhead: the ephemeral public key plus the Poly1305 tag.
pub const OVERHEAD: usize = 32 + 16;

const KEY_INFO: &[u8] = b"SEALED_BOX";

/// The box could not be opened. Truncation, corruption and wrong-key
/// failures are deliberately indistinguishable.
#[derive(Clone, Copy, Error, Debug, PartialEq, Eq)]
#[error("cannot open sealed box")]
pub struct OpenError;

/// Derive the message key binding both the ephemeral and recipient keys.
fn message_key(shared: &[u8], ephemeral_pk: &PublicKey, recipient_pk: &PublicKey) -> Key {
	let mut info = Vec::with_capacity(KEY_INFO.len() + 64);
	info.extend_from_slice(KEY_INFO);
	info.extend_from_slice(ephemeral_pk.as_bytes());
	info.extend_from_slice(recipient_pk.as_bytes());

	let mut key = [0u8; 32];
	Hkdf::<Sha256>::new(None, shared)
		.expand(&info, &mut key)
		.expect("32 bytes is always within HKDF bounds");
	Key::from(key)
}

/// Seal `msg` to the holder of `pk`.
///
/// The sender is anonymous: only a fresh ephemeral public key travels with
/// the ciphertext. `|ct| = |msg| + OVERHEAD`.
pub fn seal(pk: &PublicKey, msg: &[u8]) -> Vec<u8> {
	let ephemeral = EphemeralSecret::random_from_rng(OsRng);
	let ephemeral_pk = PublicKey::from(&ephemeral);
	let shared = ephemeral.diffie_hellman(pk);

	let key = message_key(shared.as_bytes(), &ephemeral_pk, pk);
	let cipher = ChaCha20Poly1305::new(&key);
	// The key is unique per message, so a fixed nonce is safe.
	let ct = cipher
		.encrypt(&Nonce::default(), msg)
		.expect("in-memory encryption does not fail");

	let mut out = Vec::with_capacity(32 + ct.len());
	out.extend_from_slice(ephemeral_pk.as_bytes());
	out.extend_from_slice(&ct);
	out
}

/// Open a sealed box addressed to `(sk, pk)`.
pub fn open(sk: &StaticSecret, pk: &PublicKey, ct: &[u8]) -> Result<Vec<u8>, OpenError> {
	if ct.len() < OVERHEAD {
		return Err(OpenError);
	}
	let mut ephemeral_bytes = [0u8; 32];
	ephemeral_bytes.copy_from_slice(&ct[..32]);
	let ephemeral_pk = PublicKey::from(ephemeral_bytes);
	let shared = sk.diffie_hellman(&ephemeral_pk);

	let key = message_key(shared.as_bytes(), &ephemeral_pk, pk);
	let cipher = ChaCha20Poly1305::new(&key);
	cipher.decrypt(&Nonce::default(), &ct[32..]).map_err(|_| OpenError)
}
