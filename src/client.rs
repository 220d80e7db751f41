use crate::config::{MixnetClientConfig, MixnetServerConfig};

use ctmixnet_onion::onion::{self, WrapError};
use futures::future::try_join_all;
use hyper::{Body, Method, Request, StatusCode};
use thiserror::Error;
use x25519_dalek::PublicKey;

/// Mixnet client error types
#[derive(Error, Debug)]
pub enum ClientError {
	#[error("{0}")]
	Wrap(#[from] WrapError),
	#[error("config lists {addrs} addresses but {keys} public keys")]
	KeyCountMismatch { addrs: usize, keys: usize },
	#[error("invalid public key for {addr}: {reason}")]
	BadPubKey { addr: String, reason: String },
	#[error("cannot reach {url}: {reason}")]
	Transport { url: String, reason: String },
	#[error("{url} returned status {status}")]
	Status { url: String, status: u16 },
}

/// Builds onions for a fixed cascade and posts them to the entry server.
/// Stateless between calls.
#[derive(Clone)]
pub struct MixnetClient {
	conf: MixnetClientConfig,
	pub_keys: Vec<PublicKey>,
	client: hyper::Client<hyper::client::HttpConnector>,
}

impl MixnetClient {
	pub fn new(conf: MixnetClientConfig) -> Result<MixnetClient, ClientError> {
		if conf.pub_keys.len() != conf.addrs.len() {
			return Err(ClientError::KeyCountMismatch {
				addrs: conf.addrs.len(),
				keys: conf.pub_keys.len(),
			});
		}
		let mut pub_keys = Vec::with_capacity(conf.pub_keys.len());
		for (addr, encoded) in conf.addrs.iter().zip(&conf.pub_keys) {
			pub_keys.push(decode_pub_key(addr, encoded)?);
		}
		Ok(MixnetClient {
			conf,
			pub_keys,
			client: hyper::Client::new(),
		})
	}

	/// Wrap `payload` in one layer per server and post the result to the
	/// entry. The payload length must match the cascade's `payload_len`.
	pub async fn send_message(&self, payload: &[u8]) -> Result<(), ClientError> {
		let msg = onion::wrap(&self.pub_keys, self.conf.payload_len, payload)?;

		// Entry server: highest index in the reverse-indexed array.
		// wrap() has already failed on an empty cascade, so an entry exists.
		let entry = self.conf.addrs.last().expect("cascade is nonempty");
		let url = format!("http://{}/v0/receive", entry);
		let transport_err = |reason: String| ClientError::Transport {
			url: url.clone(),
			reason,
		};

		let req = Request::builder()
			.method(Method::POST)
			.uri(url.as_str())
			.header(hyper::header::CONTENT_TYPE, "application/octet-stream")
			.body(Body::from(msg))
			.map_err(|e| transport_err(e.to_string()))?;
		let resp = self
			.client
			.request(req)
			.await
			.map_err(|e| transport_err(e.to_string()))?;
		if resp.status().as_u16() >= 400 {
			return Err(ClientError::Status {
				url,
				status: resp.status().as_u16(),
			});
		}
		Ok(())
	}
}

fn decode_pub_key(addr: &str, encoded: &str) -> Result<PublicKey, ClientError> {
	let bad_key = |reason: String| ClientError::BadPubKey {
		addr: addr.to_string(),
		reason,
	};
	let bytes = hex::decode(encoded).map_err(|e| bad_key(e.to_string()))?;
	let bytes: [u8; 32] = bytes
		.try_into()
		.map_err(|v: Vec<u8>| bad_key(format!("expected 32 bytes, got {}", v.len())))?;
	Ok(PublicKey::from(bytes))
}

/// Fetch every server's published public key and assemble a client config.
///
/// Keys land at the same (reverse) index as their address. Any fetch
/// failure, non-200 status or non-32-byte body is fatal.
pub async fn make_client_config(conf: &MixnetServerConfig) -> Result<MixnetClientConfig, ClientError> {
	let client = hyper::Client::new();
	let pub_keys = try_join_all(conf.addrs.iter().map(|addr| {
		let client = client.clone();
		async move {
			let url = format!("http://{}/v0/pubkey", addr);
			let transport_err = |reason: String| ClientError::Transport {
				url: url.clone(),
				reason,
			};

			let uri: hyper::Uri = url.parse().map_err(|e: hyper::http::uri::InvalidUri| transport_err(e.to_string()))?;
			let resp = client.get(uri).await.map_err(|e| transport_err(e.to_string()))?;
			if resp.status() != StatusCode::OK {
				return Err(ClientError::Status {
					url,
					status: resp.status().as_u16(),
				});
			}
			let body = hyper::body::to_bytes(resp.into_body())
				.await
				.map_err(|e| transport_err(e.to_string()))?;
			if body.len() != 32 {
				return Err(ClientError::BadPubKey {
					addr: addr.clone(),
					reason: format!("expected 32 bytes, got {}", body.len()),
				});
			}
			Ok(hex::encode(&body))
		}
	}))
	.await?;

	Ok(MixnetClientConfig {
		addrs: conf.addrs.clone(),
		pub_keys,
		payload_len: conf.payload_len,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use ctmixnet_onion::kdf;

	fn test_conf(depth: usize) -> MixnetClientConfig {
		let mut addrs = Vec::new();
		let mut pub_keys = Vec::new();
		for i in 0..depth {
			let (_, pk) = kdf::server_keypair(format!("key{}", i).as_bytes());
			addrs.push(format!("127.0.0.1:{}", 8000 + i));
			pub_keys.push(hex::encode(pk.as_bytes()));
		}
		MixnetClientConfig {
			addrs,
			pub_keys,
			payload_len: 10,
		}
	}

	/// An onion built by the client peels back to the payload in reverse
	/// key order: entry layer first, exit layer last.
	#[test]
	fn client_onions_peel_in_reverse_order() {
		let conf = test_conf(3);
		let client = MixnetClient::new(conf.clone()).unwrap();

		let payload = [9u8; 10];
		let mut msg = onion::wrap(&client.pub_keys, conf.payload_len, &payload).unwrap();
		assert_eq!(msg.len(), onion::message_length(2, conf.payload_len));

		for i in (0..3).rev() {
			let (sk, pk) = kdf::server_keypair(format!("key{}", i).as_bytes());
			msg = onion::peel(&sk, &pk, &msg).unwrap();
		}
		assert_eq!(msg, payload);
	}

	#[test]
	fn new_rejects_mismatched_keys() {
		let mut conf = test_conf(3);
		conf.pub_keys.pop();
		assert!(matches!(
			MixnetClient::new(conf),
			Err(ClientError::KeyCountMismatch { addrs: 3, keys: 2 })
		));
	}

	#[test]
	fn new_rejects_malformed_keys() {
		let mut conf = test_conf(2);
		conf.pub_keys[1] = "abcd".into();
		assert!(matches!(MixnetClient::new(conf), Err(ClientError::BadPubKey { .. })));

		let mut conf = test_conf(2);
		conf.pub_keys[0] = "zz".repeat(32);
		assert!(matches!(MixnetClient::new(conf), Err(ClientError::BadPubKey { .. })));
	}

	/// Wrong payload sizes are refused before anything goes on the wire.
	#[tokio::test]
	async fn send_checks_payload_length() {
		let client = MixnetClient::new(test_conf(2)).unwrap();
		assert!(matches!(
			client.send_message(&[0u8; 11]).await,
			Err(ClientError::Wrap(WrapError::WrongPayloadLength { expected: 10, found: 11 }))
		));
	}
}
