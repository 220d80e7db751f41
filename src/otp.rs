use async_trait::async_trait;
use hyper::{Body, Method, Request};
use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use thiserror::Error;

const CXID_LENGTH: usize = 36;
const CACHE_ENTRIES: usize = 1_000_000;

/// OTP check error types
#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum OtpError {
	#[error("invalid length of cxid")]
	BadRequest,
	#[error("the OTP is invalid")]
	BadOtp,
	#[error("this OTP has already been used on a different phone")]
	AlreadyBound,
	#[error("otp validation returned {status}")]
	Validator { status: u16 },
	#[error("cannot reach otp validator: {0}")]
	Transport(String),
}

/// Remote validation of an (otp, cxid) pair.
#[async_trait]
pub trait Validate: Send + Sync {
	async fn validate(&self, otp: &str, cxid: &str) -> Result<(), OtpError>;
}

/// JSON POST to the configured validator endpoint.
pub struct HttpValidator {
	url: String,
	client: hyper::Client<hyper::client::HttpConnector>,
}

#[derive(Serialize)]
struct ValidateRequest<'a> {
	#[serde(rename = "OTP")]
	otp: &'a str,
	#[serde(rename = "Cxid")]
	cxid: &'a str,
}

#[async_trait]
impl Validate for HttpValidator {
	async fn validate(&self, otp: &str, cxid: &str) -> Result<(), OtpError> {
		let body = serde_json::to_vec(&ValidateRequest { otp, cxid })
			.map_err(|e| OtpError::Transport(e.to_string()))?;
		let req = Request::builder()
			.method(Method::POST)
			.uri(self.url.as_str())
			.header(hyper::header::CONTENT_TYPE, "application/json")
			.body(Body::from(body))
			.map_err(|e| OtpError::Transport(e.to_string()))?;

		let resp = self
			.client
			.request(req)
			.await
			.map_err(|e| OtpError::Transport(e.to_string()))?;
		match resp.status().as_u16() {
			401 => Err(OtpError::BadOtp),
			403 => Err(OtpError::AlreadyBound),
			status if status >= 400 => Err(OtpError::Validator { status }),
			_ => Ok(()),
		}
	}
}

/// Validates one-shot tokens, remembering which cxid each OTP bound to.
pub struct OtpChecker {
	validator: Arc<dyn Validate>,
	// otp -> the cxid it first bound to
	cache: Mutex<LruCache<String, String>>,
}

impl OtpChecker {
	pub fn new(url: &str) -> OtpChecker {
		OtpChecker::with_validator(Arc::new(HttpValidator {
			url: url.to_string(),
			client: hyper::Client::new(),
		}))
	}

	pub fn with_validator(validator: Arc<dyn Validate>) -> OtpChecker {
		OtpChecker {
			validator,
			cache: Mutex::new(LruCache::new(
				NonZeroUsize::new(CACHE_ENTRIES).expect("cache budget is nonzero"),
			)),
		}
	}

	/// Check an (otp, cxid) pair.
	///
	/// An OTP that has bound to one cxid refuses every other cxid for the
	/// cache's lifetime; a cache hit never goes back to the validator.
	pub async fn check(&self, otp: &str, cxid: &str) -> Result<(), OtpError> {
		if cxid.len() != CXID_LENGTH {
			return Err(OtpError::BadRequest);
		}
		{
			let mut cache = self.cache.lock().unwrap();
			if let Some(bound) = cache.get(otp) {
				if bound.as_str() == cxid {
					return Ok(());
				}
				return Err(OtpError::AlreadyBound);
			}
		}
		self.validator.validate(otp, cxid).await?;
		self.cache
			.lock()
			.unwrap()
			.put(otp.to_string(), cxid.to_string());
		Ok(())
	}
}
