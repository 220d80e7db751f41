use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

/// Info-string for the per-day OPRF blinding scalar.
pub const BLINDING_KEY_LABEL: &str = "BLINDING_KEY";
/// Info-string for a server's long-term X25519 keypair.
pub const ONION_KEY_LABEL: &str = "ONION_KEY";

/// Fill `out` with key material derived from `master` for the given purpose.
///
/// HKDF-SHA256 with a zero salt and the label as info. Distinct labels yield
/// independent keys, so adding a key purpose only requires a new label.
pub fn derive(master: &[u8], label: &str, out: &mut [u8]) {
	let hk = Hkdf::<Sha256>::new(None, master);
	hk.expand(label.as_bytes(), out)
		.expect("derived key lengths are always within HKDF bounds");
}

/// Derive a server's X25519 keypair from its master key.
///
/// The secret is the first 32 bytes of the "ONION_KEY" stream, fed through
/// the standard curve25519 key-generation procedure (the library clamps).
pub fn server_keypair(master: &[u8]) -> (StaticSecret, PublicKey) {
	let mut seed = [0u8; 32];
	derive(master, ONION_KEY_LABEL, &mut seed);
	let secret = StaticSecret::from(seed);
	let public = PublicKey::from(&secret);
	(secret, public)
}
