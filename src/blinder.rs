use crate::ristretto::{self, PointError, POINT_SIZE};

use async_trait::async_trait;
use curve25519_dalek::scalar::Scalar;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use itertools::Itertools;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::OnceCell;

/// Blinding error types
#[derive(Clone, Error, Debug, PartialEq)]
pub enum BlindError {
	#[error("inputs are not distinct")]
	NotDistinct,
	#[error("{0}")]
	Point(#[from] PointError),
	#[error("cannot load key for day {day}: {reason}")]
	KeyLoad { day: i64, reason: String },
}

/// The OPRF scalar for a single day.
#[derive(Clone)]
pub struct BlindingKey {
	scalar: Scalar,
}

impl BlindingKey {
	pub fn new(master: &[u8]) -> BlindingKey {
		BlindingKey {
			scalar: ristretto::blinding_scalar(master),
		}
	}

	/// Apply the day's scalar to a batch of encoded points.
	///
	/// The batch must be pairwise distinct; a single duplicate or invalid
	/// point fails the whole batch. The outputs are returned uniformly
	/// permuted so the input/output correspondence is hidden.
	pub fn blind(&self, inputs: &[Vec<u8>]) -> Result<Vec<[u8; POINT_SIZE]>, BlindError> {
		let mut sorted: Vec<&[u8]> = inputs.iter().map(|v| v.as_slice()).collect();
		sorted.sort_unstable();
		if sorted.iter().tuple_windows().any(|(a, b)| a == b) {
			return Err(BlindError::NotDistinct);
		}

		let mut outputs = Vec::with_capacity(inputs.len());
		for input in inputs {
			outputs.push(ristretto::scalar_mult(&self.scalar, input)?);
		}
		outputs.shuffle(&mut OsRng);
		Ok(outputs)
	}
}

/// Loads a day's master key from wherever keys are provisioned.
#[async_trait]
pub trait KeyReader: Send + Sync {
	async fn read_key(&self, day: i64) -> std::io::Result<Vec<u8>>;
}

/// Reads `<dir>/<day>.key` files.
pub struct DirKeyReader {
	dir: PathBuf,
}

impl DirKeyReader {
	pub fn new(dir: PathBuf) -> DirKeyReader {
		DirKeyReader { dir }
	}
}

#[async_trait]
impl KeyReader for DirKeyReader {
	async fn read_key(&self, day: i64) -> std::io::Result<Vec<u8>> {
		tokio::fs::read(self.dir.join(format!("{}.key", day))).await
	}
}

/// The OPRF service: a process-lifetime cache of per-day blinding keys.
pub struct Blinder {
	reader: Arc<dyn KeyReader>,
	// One single-flight cell per day. The map lock is only held to look up
	// or insert a cell, never across a key load, so slow loads do not
	// serialize unrelated days.
	keys: Mutex<HashMap<i64, Arc<OnceCell<BlindingKey>>>>,
}

impl Blinder {
	pub fn new(reader: Arc<dyn KeyReader>) -> Blinder {
		Blinder {
			reader,
			keys: Mutex::new(HashMap::new()),
		}
	}

	/// Return the cached key for `day`, loading it on first use.
	///
	/// Loading is serialized per day; a failed load leaves the cell empty
	/// so the next request retries. Other days are unaffected.
	pub async fn key_for_day(&self, day: i64) -> Result<BlindingKey, BlindError> {
		let cell = {
			let mut keys = self.keys.lock().unwrap();
			keys.entry(day).or_insert_with(|| Arc::new(OnceCell::new())).clone()
		};
		let key = cell
			.get_or_try_init(|| async {
				let master = self.reader.read_key(day).await.map_err(|e| BlindError::KeyLoad {
					day,
					reason: e.to_string(),
				})?;
				Ok::<BlindingKey, BlindError>(BlindingKey::new(&master))
			})
			.await?;
		Ok(key.clone())
	}

	pub async fn blind(&self, day: i64, inputs: &[Vec<u8>]) -> Result<Vec<[u8; POINT_SIZE]>, BlindError> {
		self.key_for_day(day).await?.blind(inputs)
	}
}

#[derive(Deserialize)]
pub struct BlindingRequest {
	#[serde(rename = "DayID")]
	pub day_id: i64,
	#[serde(rename = "Inputs")]
	pub inputs: Vec<String>,
}

#[derive(Serialize)]
pub struct BlindingResponse {
	#[serde(rename = "Outputs")]
	pub outputs: Vec<String>,
}

async fn blind_tokens(blinder: &Blinder, req: Request<Body>) -> Result<BlindingResponse, String> {
	let body = hyper::body::to_bytes(req.into_body())
		.await
		.map_err(|e| e.to_string())?;
	let r: BlindingRequest = serde_json::from_slice(&body).map_err(|e| e.to_string())?;

	let mut inputs = Vec::with_capacity(r.inputs.len());
	for s in &r.inputs {
		inputs.push(hex::decode(s).map_err(|e| e.to_string())?);
	}

	let outputs = blinder.blind(r.day_id, &inputs).await.map_err(|e| e.to_string())?;
	Ok(BlindingResponse {
		outputs: outputs.iter().map(hex::encode).collect(),
	})
}

async fn handle(blinder: Arc<Blinder>, req: Request<Body>) -> Result<Response<Body>, Infallible> {
	let response = match (req.method(), req.uri().path()) {
		(&Method::POST, "/v0/blind") => match blind_tokens(&blinder, req).await {
			Ok(resp) => {
				let body = serde_json::to_vec(&resp).expect("response serialization does not fail");
				Response::builder()
					.status(StatusCode::OK)
					.header(hyper::header::CONTENT_TYPE, "application/json")
					.body(Body::from(body))
			}
			Err(reason) => {
				log::warn!("request error: {}", reason);
				Response::builder()
					.status(StatusCode::BAD_REQUEST)
					.body(Body::from(reason))
			}
		},
		(_, "/v0/blind") => Response::builder()
			.status(StatusCode::BAD_REQUEST)
			.body(Body::from("Only POST allowed")),
		_ => Response::builder()
			.status(StatusCode::NOT_FOUND)
			.body(Body::empty()),
	};
	Ok(response.expect("static response parts are valid"))
}

/// Serve `POST /v0/blind` until the server fails.
pub async fn listen(addr: SocketAddr, blinder: Arc<Blinder>) -> Result<(), hyper::Error> {
	let make_svc = make_service_fn(move |_conn| {
		let blinder = blinder.clone();
		async move { Ok::<_, Infallible>(service_fn(move |req| handle(blinder.clone(), req))) }
	});
	log::info!("blinder listening on {}", addr);
	Server::bind(&addr).serve(make_svc).await
}
