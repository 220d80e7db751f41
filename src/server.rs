use crate::config::MixnetServerConfig;
use crate::otp::{OtpChecker, OtpError};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ctmixnet_onion::{kdf, onion};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use x25519_dalek::{PublicKey, StaticSecret};

const BACKOFF_FLOOR: Duration = Duration::from_secs(10);
const BACKOFF_CAP: Duration = Duration::from_secs(160);

/// Mixnet server error types
#[derive(Error, Debug)]
pub enum ServerError {
	#[error("server index {idx} out of range for {count} servers")]
	IndexOutOfRange { idx: usize, count: usize },
	#[error("min_batch_size must be at least 1")]
	ZeroBatchSize,
	#[error("exit server requires an output_addr")]
	MissingOutputAddr,
	#[error("{0}")]
	Io(#[from] std::io::Error),
	#[error("{0}")]
	Http(#[from] hyper::Error),
}

/// Ingress rejection reasons. Per-message crypto failures never appear
/// here; they are logged and dropped so the caller cannot distinguish them.
#[derive(Error, Debug)]
pub enum ReceiveError {
	#[error("mix buffer is full")]
	BufferFull,
	#[error("an OTP is required")]
	MissingOtp,
	#[error("{0}")]
	Otp(#[from] OtpError),
}

#[derive(Error, Debug)]
pub enum DeliveryError {
	#[error("cannot reach {url}: {reason}")]
	Transport { url: String, reason: String },
	#[error("{url} returned status {status}")]
	Status { url: String, status: u16 },
}

/// Downstream delivery of a flushed batch: the next hop for inner servers,
/// the configured output for the exit.
#[async_trait]
pub trait Delivery: Send + Sync {
	async fn deliver(&self, msgs: &[Vec<u8>]) -> Result<(), DeliveryError>;
}

/// POSTs batches as a JSON `PutOnionsRequest`.
pub struct HttpDelivery {
	url: String,
	client: hyper::Client<hyper::client::HttpConnector>,
}

impl HttpDelivery {
	pub fn new(url: String) -> HttpDelivery {
		HttpDelivery {
			url,
			client: hyper::Client::new(),
		}
	}
}

#[async_trait]
impl Delivery for HttpDelivery {
	async fn deliver(&self, msgs: &[Vec<u8>]) -> Result<(), DeliveryError> {
		let transport_err = |reason: String| DeliveryError::Transport {
			url: self.url.clone(),
			reason,
		};

		let body = serde_json::to_vec(&PutOnionsRequest {
			msgs: msgs.iter().map(|m| BASE64.encode(m)).collect(),
			otp: None,
			cxid: None,
		})
		.map_err(|e| transport_err(e.to_string()))?;

		let req = Request::builder()
			.method(Method::POST)
			.uri(self.url.as_str())
			.header(hyper::header::CONTENT_TYPE, "application/json")
			.body(Body::from(body))
			.map_err(|e| transport_err(e.to_string()))?;

		let resp = self
			.client
			.request(req)
			.await
			.map_err(|e| transport_err(e.to_string()))?;
		if resp.status().as_u16() >= 400 {
			return Err(DeliveryError::Status {
				url: self.url.clone(),
				status: resp.status().as_u16(),
			});
		}
		Ok(())
	}
}

/// JSON body of `POST /v0/receive`.
#[derive(Serialize, Deserialize)]
pub struct PutOnionsRequest {
	/// Base64-encoded onions of length `L(idx)`.
	pub msgs: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub otp: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cxid: Option<String>,
}

/// A single hop in the cascade.
///
/// Decrypted onions accumulate in a shared buffer; a lone egress task
/// flushes exact `min_batch_size` batches, shuffled, to the next hop.
pub struct MixnetServer {
	conf: MixnetServerConfig,
	idx: usize,
	secret: StaticSecret,
	public: PublicKey,
	otp: Option<OtpChecker>,
	next: Arc<dyn Delivery>,
	// Messages to forward, already decrypted. Never hold this lock across I/O.
	buffer: Mutex<Vec<Vec<u8>>>,
	flush: Notify,
}

fn receive_url(addr: &str) -> String {
	format!("http://{}/v0/receive", addr)
}

impl MixnetServer {
	/// Build the server at position `idx` (0 = exit) with HTTP delivery to
	/// the next hop, or to `output_addr` for the exit.
	pub fn new(conf: MixnetServerConfig, idx: usize, master: &[u8]) -> Result<Arc<MixnetServer>, ServerError> {
		if idx >= conf.addrs.len() {
			return Err(ServerError::IndexOutOfRange {
				idx,
				count: conf.addrs.len(),
			});
		}
		if conf.min_batch_size == 0 {
			return Err(ServerError::ZeroBatchSize);
		}
		let next: Arc<dyn Delivery> = if idx > 0 {
			Arc::new(HttpDelivery::new(receive_url(&conf.addrs[idx - 1])))
		} else {
			let url = conf.output_addr.clone().ok_or(ServerError::MissingOutputAddr)?;
			Arc::new(HttpDelivery::new(url))
		};
		Ok(MixnetServer::with_delivery(conf, idx, master, next))
	}

	/// Like `new`, but with an injected downstream. Used by `new` itself
	/// and by tests that capture forwarded batches.
	pub fn with_delivery(
		conf: MixnetServerConfig,
		idx: usize,
		master: &[u8],
		next: Arc<dyn Delivery>,
	) -> Arc<MixnetServer> {
		let (secret, public) = kdf::server_keypair(master);
		// The OTP gate only exists at the entry end of the cascade.
		let otp = if idx + 1 == conf.addrs.len() {
			conf.otp_check.as_deref().map(OtpChecker::new)
		} else {
			None
		};
		Arc::new(MixnetServer {
			conf,
			idx,
			secret,
			public,
			otp,
			next,
			buffer: Mutex::new(Vec::new()),
			flush: Notify::new(),
		})
	}

	fn name(&self) -> &str {
		&self.conf.addrs[self.idx]
	}

	pub fn public_key(&self) -> &PublicKey {
		&self.public
	}

	fn message_length(&self) -> usize {
		onion::message_length(self.idx, self.conf.payload_len)
	}

	/// Ingest a batch of onions.
	///
	/// The whole batch is rejected on backpressure or a failed OTP check.
	/// Individual messages of the wrong length, or that fail to decrypt,
	/// are logged and dropped with no distinction visible to the caller.
	pub async fn receive(&self, msgs: Vec<Vec<u8>>, otp: Option<(String, String)>) -> Result<(), ReceiveError> {
		{
			let buffer = self.buffer.lock().unwrap();
			if buffer.len() + msgs.len() > self.conf.max_buffered_messages {
				return Err(ReceiveError::BufferFull);
			}
		}

		if let Some(checker) = &self.otp {
			let (otp, cxid) = otp.ok_or(ReceiveError::MissingOtp)?;
			checker.check(&otp, &cxid).await?;
		}

		let expected_len = self.message_length();
		let mut peeled = Vec::with_capacity(msgs.len());
		for msg in &msgs {
			if msg.len() != expected_len {
				log::info!("{}: received message of invalid length", self.name());
				continue;
			}
			match onion::peel(&self.secret, &self.public, msg) {
				Ok(inner) => peeled.push(inner),
				Err(_) => log::info!("{}: received invalid message", self.name()),
			}
		}
		if peeled.is_empty() {
			return Ok(());
		}

		let mut buffer = self.buffer.lock().unwrap();
		let before = buffer.len();
		buffer.append(&mut peeled);
		// Edge-triggered: signal only when this append crosses the threshold.
		if before < self.conf.min_batch_size && buffer.len() >= self.conf.min_batch_size {
			self.flush.notify_one();
		}
		Ok(())
	}

	/// Block until the buffer holds at least one full batch.
	async fn wait_for_batch(&self) {
		loop {
			let notified = self.flush.notified();
			if self.buffer.lock().unwrap().len() >= self.conf.min_batch_size {
				return;
			}
			notified.await;
		}
	}

	/// The single egress task: take the head batch, shuffle, forward.
	///
	/// On failure the buffer is left intact and the batch is re-selected
	/// from the head after a backoff. The head is stable across retries
	/// because only this task removes entries.
	async fn egress_loop(self: Arc<Self>) {
		let mut backoff = BACKOFF_FLOOR;
		loop {
			self.wait_for_batch().await;

			let mut to_send = {
				let buffer = self.buffer.lock().unwrap();
				if buffer.len() < self.conf.min_batch_size {
					continue;
				}
				buffer[..self.conf.min_batch_size].to_vec()
			};
			// Arrival order dies here.
			to_send.shuffle(&mut OsRng);

			match self.next.deliver(&to_send).await {
				Ok(()) => {
					let mut buffer = self.buffer.lock().unwrap();
					buffer.drain(..self.conf.min_batch_size);
					backoff = BACKOFF_FLOOR;
					log::debug!("{}: forwarded {} messages", self.name(), to_send.len());
				}
				Err(e) => {
					// Buffered plaintexts are never dropped; retry forever.
					log::warn!(
						"{}: cannot forward batch: {}; retrying in {:?}",
						self.name(),
						e,
						backoff
					);
					tokio::time::sleep(backoff).await;
					backoff = (backoff * 2).min(BACKOFF_CAP);
				}
			}
		}
	}

	/// Spawn the egress task and serve the HTTP endpoints until failure.
	pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<(), ServerError> {
		let listener = std::net::TcpListener::bind(addr)?;
		self.run_with_listener(listener).await
	}

	/// `run` on an already-bound listener.
	pub async fn run_with_listener(self: Arc<Self>, listener: std::net::TcpListener) -> Result<(), ServerError> {
		listener.set_nonblocking(true)?;
		tokio::spawn(self.clone().egress_loop());

		let server = self;
		let make_svc = make_service_fn(move |_conn| {
			let server = server.clone();
			async move { Ok::<_, Infallible>(service_fn(move |req| handle(server.clone(), req))) }
		});
		Server::from_tcp(listener)?.serve(make_svc).await?;
		Ok(())
	}
}

fn text_response(status: StatusCode, body: String) -> Response<Body> {
	Response::builder()
		.status(status)
		.body(Body::from(body))
		.expect("static response parts are valid")
}

async fn handle(server: Arc<MixnetServer>, req: Request<Body>) -> Result<Response<Body>, Infallible> {
	let response = match (req.method(), req.uri().path()) {
		(&Method::POST, "/v0/receive") => receive_http(&server, req).await,
		(_, "/v0/receive") => text_response(StatusCode::BAD_REQUEST, "only POST allowed".into()),
		(&Method::GET, "/v0/pubkey") => Response::builder()
			.status(StatusCode::OK)
			.header(hyper::header::CONTENT_TYPE, "application/octet-stream")
			.body(Body::from(server.public.as_bytes().to_vec()))
			.expect("static response parts are valid"),
		(&Method::GET, "/v0/config") => {
			// The config carries no secrets; the master key never enters it.
			let body = serde_json::to_vec(&server.conf).expect("config serialization does not fail");
			Response::builder()
				.status(StatusCode::OK)
				.header(hyper::header::CONTENT_TYPE, "application/json")
				.body(Body::from(body))
				.expect("static response parts are valid")
		}
		_ => text_response(StatusCode::NOT_FOUND, String::new()),
	};
	Ok(response)
}

async fn receive_http(server: &Arc<MixnetServer>, req: Request<Body>) -> Response<Body> {
	let is_json = req
		.headers()
		.get(hyper::header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.starts_with("application/json"))
		.unwrap_or(false);

	let body = match hyper::body::to_bytes(req.into_body()).await {
		Ok(body) => body,
		Err(e) => return text_response(StatusCode::BAD_REQUEST, format!("cannot read body: {}", e)),
	};

	let (msgs, otp) = if is_json {
		let r: PutOnionsRequest = match serde_json::from_slice(&body) {
			Ok(r) => r,
			Err(e) => return text_response(StatusCode::BAD_REQUEST, e.to_string()),
		};
		let mut msgs = Vec::with_capacity(r.msgs.len());
		for encoded in &r.msgs {
			match BASE64.decode(encoded) {
				Ok(msg) => msgs.push(msg),
				Err(e) => return text_response(StatusCode::BAD_REQUEST, e.to_string()),
			}
		}
		(msgs, r.otp.zip(r.cxid))
	} else {
		// Raw mode: a concatenation of fixed-size onions.
		let msg_len = server.message_length();
		if body.len() % msg_len != 0 {
			return text_response(StatusCode::BAD_REQUEST, "cannot read full message".into());
		}
		(body.chunks(msg_len).map(|c| c.to_vec()).collect(), None)
	};

	match server.receive(msgs, otp).await {
		Ok(()) => Response::builder()
			.status(StatusCode::ACCEPTED)
			.body(Body::empty())
			.expect("static response parts are valid"),
		Err(e @ ReceiveError::BufferFull) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
		Err(ReceiveError::Otp(e @ (OtpError::Validator { .. } | OtpError::Transport(_)))) => {
			text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
		}
		Err(e) => text_response(StatusCode::BAD_REQUEST, e.to_string()),
	}
}

#[cfg(test)]
pub mod mock {
	use super::{Delivery, DeliveryError};
	use async_trait::async_trait;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use tokio::sync::mpsc::UnboundedSender;

	/// Captures forwarded batches on a channel.
	pub struct ChannelDelivery {
		pub tx: UnboundedSender<Vec<Vec<u8>>>,
	}

	#[async_trait]
	impl Delivery for ChannelDelivery {
		async fn deliver(&self, msgs: &[Vec<u8>]) -> Result<(), DeliveryError> {
			self.tx.send(msgs.to_vec()).map_err(|e| DeliveryError::Transport {
				url: "channel".into(),
				reason: e.to_string(),
			})
		}
	}

	/// Always fails, counting attempts.
	pub struct FailingDelivery {
		pub attempts: AtomicUsize,
	}

	impl FailingDelivery {
		pub fn new() -> FailingDelivery {
			FailingDelivery {
				attempts: AtomicUsize::new(0),
			}
		}
	}

	#[async_trait]
	impl Delivery for FailingDelivery {
		async fn deliver(&self, _msgs: &[Vec<u8>]) -> Result<(), DeliveryError> {
			self.attempts.fetch_add(1, Ordering::SeqCst);
			Err(DeliveryError::Status {
				url: "mock".into(),
				status: 500,
			})
		}
	}
}
