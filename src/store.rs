use crate::pb::Notification;

use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// Size of a dead-drop identifier.
pub const ID_SIZE: usize = 16;

pub type DeadDropId = [u8; ID_SIZE];

/// Storage error types
#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum DbError {
	#[error("storage failure: {0}")]
	Storage(String),
}

/// Dead-drop storage.
///
/// `fetch` hands the drop's full message list to `handler`; the returned
/// prefix length is removed from the head only when the handler succeeds.
/// Retention policy therefore lives in the caller while the delete stays
/// atomic with the read. Implementations must serialize operations per
/// drop so concurrent put/fetch interleavings cannot lose messages.
pub trait Db: Send + Sync {
	fn put(&self, id: DeadDropId, message: Notification) -> Result<(), DbError>;
	fn fetch(
		&self,
		id: DeadDropId,
		handler: &mut dyn FnMut(&[Notification]) -> Result<usize, DbError>,
	) -> Result<(), DbError>;
}

/// Process-memory storage. Drops are created lazily on first put or fetch.
#[derive(Default)]
pub struct InMemoryDb {
	drops: Mutex<HashMap<DeadDropId, Vec<Notification>>>,
}

impl InMemoryDb {
	pub fn new() -> InMemoryDb {
		InMemoryDb::default()
	}
}

impl Db for InMemoryDb {
	fn put(&self, id: DeadDropId, message: Notification) -> Result<(), DbError> {
		let mut drops = self.drops.lock().unwrap();
		drops.entry(id).or_default().push(message);
		Ok(())
	}

	fn fetch(
		&self,
		id: DeadDropId,
		handler: &mut dyn FnMut(&[Notification]) -> Result<usize, DbError>,
	) -> Result<(), DbError> {
		let mut drops = self.drops.lock().unwrap();
		let messages = drops.entry(id).or_default();
		let drop_prefix = handler(messages)?;
		messages.drain(..drop_prefix);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn note(contents: &[u8]) -> Notification {
		Notification {
			hint: 1,
			contents: contents.to_vec(),
		}
	}

	/// Puts append in order; fetch sees the whole list.
	#[test]
	fn put_appends_in_order() {
		let db = InMemoryDb::new();
		let id = [1u8; ID_SIZE];
		db.put(id, note(b"A")).unwrap();
		db.put(id, note(b"B")).unwrap();

		let mut seen = Vec::new();
		db.fetch(id, &mut |messages| {
			seen = messages.to_vec();
			Ok(0)
		})
		.unwrap();
		assert_eq!(seen, vec![note(b"A"), note(b"B")]);
	}

	/// The handler's prefix is dropped from the head, and only on success.
	#[test]
	fn fetch_drops_exactly_the_prefix() {
		let db = InMemoryDb::new();
		let id = [2u8; ID_SIZE];
		for contents in [b"A", b"B", b"C"] {
			db.put(id, note(contents)).unwrap();
		}

		db.fetch(id, &mut |_| Ok(2)).unwrap();

		let mut seen = Vec::new();
		db.fetch(id, &mut |messages| {
			seen = messages.to_vec();
			Ok(0)
		})
		.unwrap();
		assert_eq!(seen, vec![note(b"C")]);
	}

	#[test]
	fn fetch_keeps_messages_on_handler_error() {
		let db = InMemoryDb::new();
		let id = [3u8; ID_SIZE];
		db.put(id, note(b"A")).unwrap();

		let result = db.fetch(id, &mut |_| Err(DbError::Storage("handler refused".into())));
		assert!(result.is_err());

		let mut count = 0;
		db.fetch(id, &mut |messages| {
			count = messages.len();
			Ok(0)
		})
		.unwrap();
		assert_eq!(count, 1);
	}

	/// Drops come into being on first access and stay independent.
	#[test]
	fn drops_are_lazy_and_independent() {
		let db = InMemoryDb::new();
		let a = [4u8; ID_SIZE];
		let b = [5u8; ID_SIZE];

		let mut empty = usize::MAX;
		db.fetch(a, &mut |messages| {
			empty = messages.len();
			Ok(0)
		})
		.unwrap();
		assert_eq!(empty, 0);

		db.put(a, note(b"A")).unwrap();
		let mut b_len = usize::MAX;
		db.fetch(b, &mut |messages| {
			b_len = messages.len();
			Ok(0)
		})
		.unwrap();
		assert_eq!(b_len, 0);
	}
}
