//! Envelope codec: JSON bytes <-> `Request` / `Response`.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::{Request, Response};

/// Largest envelope accepted by `decode`. Envelopes only carry paths and messages.
pub const MAX_ENVELOPE_LEN: usize = 64 * 1024;

/// Types that travel as a message envelope. Sealed to `Request` and `Response`.
pub trait Envelope: Serialize + DeserializeOwned + sealed::Sealed {}

impl Envelope for Request {}
impl Envelope for Response {}

mod sealed {
    pub trait Sealed {}
    impl Sealed for crate::protocol::Request {}
    impl Sealed for crate::protocol::Response {}
}

/// Encode an envelope into message bytes.
pub fn encode<T: Envelope>(msg: &T) -> Result<Vec<u8>, EncodeError> {
    let bytes = serde_json::to_vec(msg)?;
    if bytes.len() > MAX_ENVELOPE_LEN {
        return Err(EncodeError::TooLarge);
    }
    Ok(bytes)
}

/// Error encoding an envelope.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("envelope too large")]
    TooLarge,
}

/// Decode one envelope from message bytes. Malformed JSON, unknown discriminants and
/// missing associated fields all fail with `DecodeError::Malformed`.
pub fn decode<T: Envelope>(bytes: &[u8]) -> Result<T, DecodeError> {
    if bytes.len() > MAX_ENVELOPE_LEN {
        return Err(DecodeError::TooLarge);
    }
    Ok(serde_json::from_slice(bytes)?)
}

/// Error decoding an envelope.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("envelope too large")]
    TooLarge,
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Status;

    fn all_requests() -> Vec<Request> {
        vec![
            Request::CheckAvailability("a/b.txt".into()),
            Request::GetResource("/var/data/model.bin".into()),
            Request::SendResource("".into()),
        ]
    }

    #[test]
    fn roundtrip_requests() {
        for req in all_requests() {
            let bytes = encode(&req).unwrap();
            assert_eq!(decode::<Request>(&bytes).unwrap(), req);
        }
    }

    #[test]
    fn roundtrip_responses() {
        let mut responses: Vec<Response> = all_requests()
            .into_iter()
            .flat_map(|req| {
                [
                    Response::Ack(req.clone(), Status::Success),
                    Response::Ack(req, Status::Error("missing resource: a".into())),
                ]
            })
            .collect();
        responses.push(Response::ProtocolError("request decoding failed".into()));
        for resp in responses {
            let bytes = encode(&resp).unwrap();
            assert_eq!(decode::<Response>(&bytes).unwrap(), resp);
        }
    }

    #[test]
    fn request_wire_shape() {
        let bytes = encode(&Request::GetResource("a/b.txt".into())).unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            r#"{"rawValue":1,"associatedValue":"a/b.txt"}"#
        );
    }

    #[test]
    fn response_wire_shape() {
        let ack = Response::Ack(Request::SendResource("p".into()), Status::Success);
        assert_eq!(
            String::from_utf8(encode(&ack).unwrap()).unwrap(),
            r#"{"rawValue":0,"associatedRequest":{"rawValue":2,"associatedValue":"p"},"associatedStatus":{"rawValue":0}}"#
        );
        let err = Response::Ack(
            Request::CheckAvailability("p".into()),
            Status::Error("boom".into()),
        );
        assert_eq!(
            String::from_utf8(encode(&err).unwrap()).unwrap(),
            r#"{"rawValue":0,"associatedRequest":{"rawValue":0,"associatedValue":"p"},"associatedStatus":{"rawValue":1,"associatedValue":"boom"}}"#
        );
        let proto = Response::ProtocolError("bad".into());
        assert_eq!(
            String::from_utf8(encode(&proto).unwrap()).unwrap(),
            r#"{"rawValue":1,"associatedError":"bad"}"#
        );
    }

    #[test]
    fn decodes_regardless_of_key_order() {
        let json = br#"{"associatedValue":"x","rawValue":2}"#;
        assert_eq!(
            decode::<Request>(json).unwrap(),
            Request::SendResource("x".into())
        );
    }

    #[test]
    fn unknown_discriminant_is_decode_error() {
        let json = br#"{"rawValue":7,"associatedValue":"x"}"#;
        assert!(matches!(
            decode::<Request>(json),
            Err(DecodeError::Malformed(_))
        ));
        let json = br#"{"rawValue":5,"associatedError":"x"}"#;
        assert!(decode::<Response>(json).is_err());
        let json = br#"{"rawValue":0,"associatedRequest":{"rawValue":0,"associatedValue":"p"},"associatedStatus":{"rawValue":9}}"#;
        assert!(decode::<Response>(json).is_err());
    }

    #[test]
    fn missing_associated_field_is_decode_error() {
        assert!(decode::<Request>(br#"{"rawValue":0}"#).is_err());
        assert!(decode::<Response>(br#"{"rawValue":0}"#).is_err());
        assert!(decode::<Response>(br#"{"rawValue":1}"#).is_err());
        let json = br#"{"rawValue":0,"associatedRequest":{"rawValue":0,"associatedValue":"p"},"associatedStatus":{"rawValue":1}}"#;
        assert!(decode::<Response>(json).is_err());
    }

    #[test]
    fn garbage_is_decode_error() {
        assert!(decode::<Request>(b"\x00\x01not json").is_err());
        assert!(decode::<Response>(b"").is_err());
    }

    #[test]
    fn oversized_envelope_rejected() {
        let huge = vec![b' '; MAX_ENVELOPE_LEN + 1];
        assert!(matches!(
            decode::<Request>(&huge),
            Err(DecodeError::TooLarge)
        ));
    }
}
