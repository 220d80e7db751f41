use crate::pb::{Empty, FetchRequest, FetchResponse, Notification, PostRequestV1};
use crate::store::{Db, DbError, DeadDropId, ID_SIZE};

use byteorder::{ByteOrder, LittleEndian};
use ctmixnet_onion::{kdf, sealed};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prost::Message;
use rand::rngs::OsRng;
use rand::RngCore;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

/// Poll cursors carry the first two bytes of a notification's contents.
pub const LAST_READ_LENGTH: usize = 2;

pub const POST_PATH: &str = "/v0/notifier/post";
pub const FETCH_PATH: &str = "/v0/notifier/fetch";

/// Notifier error types
#[derive(Error, Debug)]
pub enum NotifierError {
	#[error("cannot decrypt address")]
	BadAddress,
	#[error("invalid address length: {got}, expected {want}")]
	BadAddressLength { got: usize, want: usize },
	#[error("invalid deaddrop id length: {got}, expected {want}")]
	BadDropIdLength { got: usize, want: usize },
	#[error("{0}")]
	Db(#[from] DbError),
}

/// RPC client error types
#[derive(Error, Debug)]
pub enum RpcError {
	#[error("cannot reach {url}: {reason}")]
	Transport { url: String, reason: String },
	#[error("{url} returned status {status}")]
	Status { url: String, status: u16 },
	#[error("cannot decode response: {0}")]
	Decode(#[from] prost::DecodeError),
}

/// Seal `id || hint` (hint little-endian) under the notifier's public key.
pub fn make_address_v1(notifier_pk: &PublicKey, id: &DeadDropId, hint: u16) -> Vec<u8> {
	let mut raw = [0u8; ID_SIZE + 2];
	raw[..ID_SIZE].copy_from_slice(id);
	LittleEndian::write_u16(&mut raw[ID_SIZE..], hint);
	sealed::seal(notifier_pk, &raw)
}

/// Serves the dead-drop RPCs: sealed-address posts and cursor-based polls.
pub struct PollServer {
	secret: StaticSecret,
	public: PublicKey,
	db: Arc<dyn Db>,
}

impl PollServer {
	pub fn new(master: &[u8], db: Arc<dyn Db>) -> PollServer {
		let (secret, public) = kdf::server_keypair(master);
		PollServer { secret, public, db }
	}

	pub fn public_key(&self) -> &PublicKey {
		&self.public
	}

	fn unseal_address_v1(&self, addr: &[u8]) -> Result<(u16, DeadDropId), NotifierError> {
		let dec = sealed::open(&self.secret, &self.public, addr).map_err(|_| NotifierError::BadAddress)?;
		if dec.len() != ID_SIZE + 2 {
			return Err(NotifierError::BadAddressLength {
				got: dec.len(),
				want: ID_SIZE + 2,
			});
		}
		let mut id: DeadDropId = [0u8; ID_SIZE];
		id.copy_from_slice(&dec[..ID_SIZE]);
		let hint = LittleEndian::read_u16(&dec[ID_SIZE..]);
		Ok((hint, id))
	}

	/// Decrypt the sealed address and append the notification to its drop.
	pub fn post_notification_v1(&self, req: &PostRequestV1) -> Result<Empty, NotifierError> {
		let (hint, id) = self.unseal_address_v1(&req.sealed_address)?;
		self.db.put(
			id,
			Notification {
				hint: u32::from(hint),
				contents: req.contents.clone(),
			},
		)?;
		Ok(Empty {})
	}

	/// Return the suffix strictly after the first message whose contents
	/// start with `last_read`. An empty or unmatched cursor returns the
	/// whole list. The consumed prefix is dropped atomically with the read.
	pub fn fetch_notifications(&self, req: &FetchRequest) -> Result<FetchResponse, NotifierError> {
		if req.deaddrop_id.len() != ID_SIZE {
			return Err(NotifierError::BadDropIdLength {
				got: req.deaddrop_id.len(),
				want: ID_SIZE,
			});
		}
		let mut id: DeadDropId = [0u8; ID_SIZE];
		id.copy_from_slice(&req.deaddrop_id);

		let last_read = &req.last_read;
		let mut resp = FetchResponse::default();
		self.db.fetch(id, &mut |messages| {
			let mut start = 0;
			for (i, msg) in messages.iter().enumerate() {
				if !last_read.is_empty() && msg.contents.starts_with(last_read) {
					start = i + 1;
					break;
				}
			}
			resp.notifications = messages[start..].to_vec();
			Ok(start)
		})?;
		Ok(resp)
	}

	/// Serve the RPC endpoints until failure.
	pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<(), NotifierServeError> {
		let listener = std::net::TcpListener::bind(addr)?;
		self.run_with_listener(listener).await
	}

	/// `run` on an already-bound listener.
	pub async fn run_with_listener(self: Arc<Self>, listener: std::net::TcpListener) -> Result<(), NotifierServeError> {
		listener.set_nonblocking(true)?;
		let server = self;
		let make_svc = make_service_fn(move |_conn| {
			let server = server.clone();
			async move { Ok::<_, Infallible>(service_fn(move |req| handle(server.clone(), req))) }
		});
		Server::from_tcp(listener)?.serve(make_svc).await?;
		Ok(())
	}
}

#[derive(Error, Debug)]
pub enum NotifierServeError {
	#[error("{0}")]
	Io(#[from] std::io::Error),
	#[error("{0}")]
	Http(#[from] hyper::Error),
}

fn proto_response(body: Vec<u8>) -> Response<Body> {
	Response::builder()
		.status(StatusCode::OK)
		.header(hyper::header::CONTENT_TYPE, "application/octet-stream")
		.body(Body::from(body))
		.expect("static response parts are valid")
}

fn error_response(e: &NotifierError) -> Response<Body> {
	let status = match e {
		NotifierError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
		_ => StatusCode::BAD_REQUEST,
	};
	Response::builder()
		.status(status)
		.body(Body::from(e.to_string()))
		.expect("static response parts are valid")
}

async fn handle(server: Arc<PollServer>, req: Request<Body>) -> Result<Response<Body>, Infallible> {
	let (method, path) = (req.method().clone(), req.uri().path().to_string());
	let body = match hyper::body::to_bytes(req.into_body()).await {
		Ok(body) => body,
		Err(e) => {
			return Ok(Response::builder()
				.status(StatusCode::BAD_REQUEST)
				.body(Body::from(format!("cannot read body: {}", e)))
				.expect("static response parts are valid"))
		}
	};

	let response = match (method, path.as_str()) {
		(Method::POST, POST_PATH) => match PostRequestV1::decode_length_delimited(body.as_ref()) {
			Ok(rpc) => match server.post_notification_v1(&rpc) {
				Ok(resp) => proto_response(resp.encode_length_delimited_to_vec()),
				Err(e) => {
					log::warn!("post rejected: {}", e);
					error_response(&e)
				}
			},
			Err(e) => Response::builder()
				.status(StatusCode::BAD_REQUEST)
				.body(Body::from(e.to_string()))
				.expect("static response parts are valid"),
		},
		(Method::POST, FETCH_PATH) => match FetchRequest::decode_length_delimited(body.as_ref()) {
			Ok(rpc) => match server.fetch_notifications(&rpc) {
				Ok(resp) => proto_response(resp.encode_length_delimited_to_vec()),
				Err(e) => {
					log::warn!("fetch rejected: {}", e);
					error_response(&e)
				}
			},
			Err(e) => Response::builder()
				.status(StatusCode::BAD_REQUEST)
				.body(Body::from(e.to_string()))
				.expect("static response parts are valid"),
		},
		(Method::GET, "/v0/pubkey") => Response::builder()
			.status(StatusCode::OK)
			.header(hyper::header::CONTENT_TYPE, "application/octet-stream")
			.body(Body::from(server.public.as_bytes().to_vec()))
			.expect("static response parts are valid"),
		_ => Response::builder()
			.status(StatusCode::NOT_FOUND)
			.body(Body::empty())
			.expect("static response parts are valid"),
	};
	Ok(response)
}

async fn post_proto<Req: Message, Resp: Message + Default>(
	client: &hyper::Client<hyper::client::HttpConnector>,
	url: &str,
	req: &Req,
) -> Result<Resp, RpcError> {
	let transport_err = |reason: String| RpcError::Transport {
		url: url.to_string(),
		reason,
	};

	let http_req = Request::builder()
		.method(Method::POST)
		.uri(url)
		.header(hyper::header::CONTENT_TYPE, "application/octet-stream")
		.body(Body::from(req.encode_length_delimited_to_vec()))
		.map_err(|e| transport_err(e.to_string()))?;
	let resp = client
		.request(http_req)
		.await
		.map_err(|e| transport_err(e.to_string()))?;
	if resp.status().as_u16() >= 400 {
		return Err(RpcError::Status {
			url: url.to_string(),
			status: resp.status().as_u16(),
		});
	}
	let body = hyper::body::to_bytes(resp.into_body())
		.await
		.map_err(|e| transport_err(e.to_string()))?;
	Ok(Resp::decode_length_delimited(body)?)
}

/// Posts notifications to sealed addresses; used at the mixnet exit.
pub struct NotifierClient {
	url: String,
	client: hyper::Client<hyper::client::HttpConnector>,
}

impl NotifierClient {
	pub fn new(server_addr: &str) -> NotifierClient {
		NotifierClient {
			url: format!("http://{}{}", server_addr, POST_PATH),
			client: hyper::Client::new(),
		}
	}

	pub async fn notify(&self, sealed_address: &[u8], contents: &[u8]) -> Result<(), RpcError> {
		log::debug!("notification of {} bytes", contents.len());
		let _: Empty = post_proto(
			&self.client,
			&self.url,
			&PostRequestV1 {
				sealed_address: sealed_address.to_vec(),
				contents: contents.to_vec(),
			},
		)
		.await?;
		Ok(())
	}
}

/// A client-side mailbox: a random drop ID plus the resumable poll cursor.
pub struct DeadDropClient {
	url: String,
	client: hyper::Client<hyper::client::HttpConnector>,
	notifier_pk: PublicKey,
	address: DeadDropId,
	last_received: [u8; LAST_READ_LENGTH],
}

impl DeadDropClient {
	/// Create a mailbox with a fresh random drop ID.
	pub fn new(server_addr: &str, notifier_pk: PublicKey) -> DeadDropClient {
		let mut address: DeadDropId = [0u8; ID_SIZE];
		OsRng.fill_bytes(&mut address);
		DeadDropClient {
			url: format!("http://{}{}", server_addr, FETCH_PATH),
			client: hyper::Client::new(),
			notifier_pk,
			address,
			last_received: [0u8; LAST_READ_LENGTH],
		}
	}

	pub fn address(&self) -> &DeadDropId {
		&self.address
	}

	/// Seal this mailbox's drop ID and `hint` into an anonymous address.
	pub fn make_address_v1(&self, hint: u16) -> Vec<u8> {
		make_address_v1(&self.notifier_pk, &self.address, hint)
	}

	/// Fetch everything after the cursor and advance it to the first
	/// `LAST_READ_LENGTH` bytes of the newest returned contents.
	pub async fn poll(&mut self) -> Result<Vec<Notification>, RpcError> {
		let req = FetchRequest {
			deaddrop_id: self.address.to_vec(),
			last_read: self.last_received.to_vec(),
		};
		let resp: FetchResponse = post_proto(&self.client, &self.url, &req).await?;
		if let Some(last) = resp.notifications.last() {
			let n = last.contents.len().min(LAST_READ_LENGTH);
			self.last_received[..n].copy_from_slice(&last.contents[..n]);
		}
		Ok(resp.notifications)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::InMemoryDb;

	fn new_server() -> PollServer {
		PollServer::new(b"notifier-master", Arc::new(InMemoryDb::new()))
	}

	fn post(server: &PollServer, id: &DeadDropId, hint: u16, contents: &[u8]) {
		let req = PostRequestV1 {
			sealed_address: make_address_v1(server.public_key(), id, hint),
			contents: contents.to_vec(),
		};
		server.post_notification_v1(&req).unwrap();
	}

	fn fetch(server: &PollServer, id: &DeadDropId, last_read: &[u8]) -> Vec<Notification> {
		server
			.fetch_notifications(&FetchRequest {
				deaddrop_id: id.to_vec(),
				last_read: last_read.to_vec(),
			})
			.unwrap()
			.notifications
	}

	/// Sealed addresses round-trip: the hint comes back little-endian and
	/// the drop ID is the one sealed in.
	#[test]
	fn address_round_trip() {
		let server = new_server();
		let id: DeadDropId = [7u8; ID_SIZE];

		let sealed_addr = make_address_v1(server.public_key(), &id, 0x0102);
		assert_eq!(sealed_addr.len(), ID_SIZE + 2 + sealed::OVERHEAD);

		let (hint, got_id) = server.unseal_address_v1(&sealed_addr).unwrap();
		assert_eq!(hint, 0x0102);
		assert_eq!(got_id, id);
	}

	/// The hint's low byte is stored first.
	#[test]
	fn address_hint_is_little_endian() {
		let server = new_server();
		let id: DeadDropId = [0u8; ID_SIZE];

		let mut raw = [0u8; ID_SIZE + 2];
		raw[ID_SIZE] = 0x34;
		raw[ID_SIZE + 1] = 0x12;
		let sealed_addr = sealed::seal(server.public_key(), &raw);

		let (hint, _) = server.unseal_address_v1(&sealed_addr).unwrap();
		assert_eq!(hint, 0x1234);
	}

	#[test]
	fn unseal_rejects_corruption() {
		let server = new_server();
		let mut sealed_addr = make_address_v1(server.public_key(), &[0u8; ID_SIZE], 1);
		sealed_addr[0] ^= 0x01;
		assert!(matches!(
			server.unseal_address_v1(&sealed_addr),
			Err(NotifierError::BadAddress)
		));
	}

	/// A validly sealed box of the wrong plaintext size is rejected with a
	/// client-visible error.
	#[test]
	fn unseal_rejects_wrong_plaintext_length() {
		let server = new_server();
		let sealed_addr = sealed::seal(server.public_key(), &[0u8; ID_SIZE + 1]);
		assert!(matches!(
			server.unseal_address_v1(&sealed_addr),
			Err(NotifierError::BadAddressLength { got: 17, want: 18 })
		));
	}

	#[test]
	fn fetch_rejects_bad_drop_id_length() {
		let server = new_server();
		let result = server.fetch_notifications(&FetchRequest {
			deaddrop_id: vec![0u8; ID_SIZE - 1],
			last_read: Vec::new(),
		});
		assert!(matches!(result, Err(NotifierError::BadDropIdLength { .. })));
	}

	/// Cursor semantics on a drop holding A, B, C: an empty cursor and an
	/// unmatched cursor both return everything; a matching cursor returns
	/// the strict suffix and consumes through the match.
	#[test]
	fn fetch_cursor_semantics() {
		let server = new_server();
		let id: DeadDropId = [0u8; ID_SIZE];
		post(&server, &id, 1, b"A");
		post(&server, &id, 2, b"B");
		post(&server, &id, 3, b"C");

		let all = fetch(&server, &id, b"");
		assert_eq!(all.len(), 3);
		assert_eq!(all[0].contents, b"A");
		assert_eq!(all[2].contents, b"C");
		assert_eq!(all[1].hint, 2);

		// No message starts with "Z": everything again, nothing consumed.
		assert_eq!(fetch(&server, &id, b"Z").len(), 3);

		// "A" matches the first message: the last two come back...
		let after_a = fetch(&server, &id, b"A");
		assert_eq!(after_a.len(), 2);
		assert_eq!(after_a[0].contents, b"B");
		assert_eq!(after_a[1].contents, b"C");

		// ...and the consumed prefix is gone from the drop.
		assert_eq!(fetch(&server, &id, b"").len(), 2);
	}

	/// Notifications delivered to one drop never appear in another.
	#[test]
	fn drops_are_isolated() {
		let server = new_server();
		post(&server, &[1u8; ID_SIZE], 1, b"one");
		assert_eq!(fetch(&server, &[2u8; ID_SIZE], b"").len(), 0);
	}

	/// Full loop over HTTP: notify through the RPC surface, poll with a
	/// DeadDropClient, and resume from the advanced cursor.
	#[tokio::test(flavor = "multi_thread")]
	async fn rpc_round_trip() {
		let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		let addr = listener.local_addr().unwrap().to_string();
		let server = Arc::new(new_server());
		let public = *server.public_key();
		tokio::spawn(async move {
			server.run_with_listener(listener).await.unwrap();
		});

		let notifier = NotifierClient::new(&addr);
		let mut mailbox = DeadDropClient::new(&addr, public);

		notifier
			.notify(&mailbox.make_address_v1(1), b"AAAA")
			.await
			.unwrap();
		notifier
			.notify(&mailbox.make_address_v1(2), b"BBBB")
			.await
			.unwrap();

		let first = mailbox.poll().await.unwrap();
		assert_eq!(first.len(), 2);
		assert_eq!(first[0].hint, 1);
		assert_eq!(first[1].contents, b"BBBB");

		// The cursor now points at "BB"; only newer messages come back.
		notifier
			.notify(&mailbox.make_address_v1(3), b"CCCC")
			.await
			.unwrap();
		let second = mailbox.poll().await.unwrap();
		assert_eq!(second.len(), 1);
		assert_eq!(second[0].contents, b"CCCC");
	}

	/// Corrupted sealed addresses surface as a 400 over the RPC.
	#[tokio::test(flavor = "multi_thread")]
	async fn rpc_rejects_bad_addresses() {
		let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		let addr = listener.local_addr().unwrap().to_string();
		let server = Arc::new(new_server());
		tokio::spawn(async move {
			server.run_with_listener(listener).await.unwrap();
		});

		let notifier = NotifierClient::new(&addr);
		let result = notifier.notify(&[0u8; 64], b"contents").await;
		assert!(matches!(result, Err(RpcError::Status { status: 400, .. })));
	}
}
