//! Wire messages for the notifier RPC.
//!
//! Field numbers are part of the wire contract and must not change.

use prost::Message;

#[derive(Clone, PartialEq, Message)]
pub struct PostRequestV1 {
	#[prost(bytes = "vec", tag = "1")]
	pub sealed_address: Vec<u8>,
	#[prost(bytes = "vec", tag = "2")]
	pub contents: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct FetchRequest {
	#[prost(bytes = "vec", tag = "1")]
	pub deaddrop_id: Vec<u8>,
	#[prost(bytes = "vec", tag = "2")]
	pub last_read: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct FetchResponse {
	#[prost(message, repeated, tag = "1")]
	pub notifications: Vec<Notification>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Notification {
	#[prost(uint32, tag = "1")]
	pub hint: u32,
	#[prost(bytes = "vec", tag = "2")]
	pub contents: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Empty {}

#[cfg(test)]
mod tests {
	use super::*;
	use prost::Message;

	/// Messages survive the length-delimited framing used on the wire.
	#[test]
	fn length_delimited_round_trip() {
		let notification = Notification {
			hint: 0xBEEF,
			contents: b"contents".to_vec(),
		};
		let framed = notification.encode_length_delimited_to_vec();
		let back = Notification::decode_length_delimited(framed.as_slice()).unwrap();
		assert_eq!(back, notification);

		let resp = FetchResponse {
			notifications: vec![notification],
		};
		let framed = resp.encode_length_delimited_to_vec();
		let back = FetchResponse::decode_length_delimited(framed.as_slice()).unwrap();
		assert_eq!(back, resp);
	}

	/// Unset fields take their proto3 defaults on decode.
	#[test]
	fn decode_applies_defaults() {
		let empty = FetchRequest::decode_length_delimited(
			FetchRequest::default().encode_length_delimited_to_vec().as_slice(),
		)
		.unwrap();
		assert!(empty.deaddrop_id.is_empty());
		assert!(empty.last_read.is_empty());
	}
}
