use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Config error types
#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("cannot read {path}: {source}")]
	Io {
		path: String,
		source: std::io::Error,
	},
	#[error("cannot fetch {url}: {reason}")]
	Fetch { url: String, reason: String },
	#[error("got status code {status} from {url}")]
	Status { status: u16, url: String },
	#[error("cannot parse config: {0}")]
	Parse(#[from] serde_json::Error),
}

/// Cascade description shared by every mixnet server.
///
/// `addrs` is reverse-indexed: `addrs[0]` is the exit, `addrs[N-1]` the
/// entry. A server learns its own position from the `--idx` flag.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MixnetServerConfig {
	pub addrs: Vec<String>,
	/// Flush trigger and exact flush size.
	pub min_batch_size: usize,
	/// Length of the innermost payload surfaced at the exit.
	pub payload_len: usize,
	/// Backpressure limit; batches that would exceed it are rejected whole.
	pub max_buffered_messages: usize,
	/// URL where the exit delivers fully peeled payloads.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub output_addr: Option<String>,
	/// OTP validation endpoint, enforced only at the entry server.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub otp_check: Option<String>,
}

/// Everything a client needs to build onions for a cascade.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MixnetClientConfig {
	pub addrs: Vec<String>,
	/// Hex-encoded 32-byte X25519 public keys, reverse-indexed like `addrs`.
	pub pub_keys: Vec<String>,
	pub payload_len: usize,
}

/// Load a JSON config from a filesystem path or an `http(s)://` URL.
pub async fn load_config<T: DeserializeOwned>(path: &str) -> Result<T, ConfigError> {
	let contents = if path.starts_with("http://") || path.starts_with("https://") {
		fetch_http(path).await?
	} else {
		tokio::fs::read(path).await.map_err(|source| ConfigError::Io {
			path: path.to_string(),
			source,
		})?
	};
	Ok(serde_json::from_slice(&contents)?)
}

async fn fetch_http(url: &str) -> Result<Vec<u8>, ConfigError> {
	let fetch_err = |reason: String| ConfigError::Fetch {
		url: url.to_string(),
		reason,
	};

	let uri: hyper::Uri = url.parse().map_err(|e: hyper::http::uri::InvalidUri| fetch_err(e.to_string()))?;
	let client = hyper::Client::new();
	let resp = client.get(uri).await.map_err(|e| fetch_err(e.to_string()))?;
	if resp.status().as_u16() >= 400 {
		return Err(ConfigError::Status {
			status: resp.status().as_u16(),
			url: url.to_string(),
		});
	}
	let body = hyper::body::to_bytes(resp.into_body())
		.await
		.map_err(|e| fetch_err(e.to_string()))?;
	Ok(body.to_vec())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample() -> MixnetServerConfig {
		MixnetServerConfig {
			addrs: vec!["127.0.0.1:8000".into(), "127.0.0.1:8001".into()],
			min_batch_size: 10,
			payload_len: 10,
			max_buffered_messages: 1000,
			output_addr: Some("http://127.0.0.1:9000/sink".into()),
			otp_check: None,
		}
	}

	/// Configs survive a JSON round trip unchanged.
	#[test]
	fn server_config_round_trip() {
		let conf = sample();
		let json = serde_json::to_string(&conf).unwrap();
		let back: MixnetServerConfig = serde_json::from_str(&json).unwrap();
		assert_eq!(back.addrs, conf.addrs);
		assert_eq!(back.min_batch_size, conf.min_batch_size);
		assert_eq!(back.output_addr, conf.output_addr);
		assert_eq!(back.otp_check, None);
	}

	#[tokio::test]
	async fn load_config_reads_files() {
		let dir = std::env::temp_dir().join("ctmixnet-config-test");
		std::fs::create_dir_all(&dir).unwrap();
		let path = dir.join("conf.json");
		std::fs::write(&path, serde_json::to_vec(&sample()).unwrap()).unwrap();

		let conf: MixnetServerConfig = load_config(path.to_str().unwrap()).await.unwrap();
		assert_eq!(conf.payload_len, 10);
	}

	#[tokio::test]
	async fn load_config_reports_missing_files() {
		let result: Result<MixnetServerConfig, _> = load_config("/nonexistent/conf.json").await;
		assert!(matches!(result, Err(ConfigError::Io { .. })));
	}
}
