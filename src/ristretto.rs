use ctmixnet_onion::kdf;

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use thiserror::Error;

/// Size of an encoded Ristretto255 point.
pub const POINT_SIZE: usize = 32;

/// Error types for Ristretto255 group operations
#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum PointError {
	#[error("invalid length of curve point")]
	InvalidLength,
	#[error("point not on curve")]
	NotOnCurve,
}

/// Derive the blinding scalar from a day's master key.
///
/// Reads 64 bytes of the "BLINDING_KEY" stream and reduces mod the group
/// order, so the scalar is uniform in the full scalar field.
pub fn blinding_scalar(master: &[u8]) -> Scalar {
	let mut wide = [0u8; 64];
	kdf::derive(master, kdf::BLINDING_KEY_LABEL, &mut wide);
	Scalar::from_bytes_mod_order_wide(&wide)
}

/// Multiply an encoded point by `k` and return the encoded result.
///
/// Mirrors libsodium's scalarmult contract: a malformed encoding fails, and
/// so does an identity result (which would otherwise leak that the input was
/// the identity or the scalar zero).
pub fn scalar_mult(k: &Scalar, encoded: &[u8]) -> Result<[u8; POINT_SIZE], PointError> {
	if encoded.len() != POINT_SIZE {
		return Err(PointError::InvalidLength);
	}
	let point = CompressedRistretto::from_slice(encoded)
		.map_err(|_| PointError::NotOnCurve)?
		.decompress()
		.ok_or(PointError::NotOnCurve)?;

	let out = k * point;
	if out == RistrettoPoint::identity() {
		return Err(PointError::NotOnCurve);
	}
	Ok(out.compress().to_bytes())
}
