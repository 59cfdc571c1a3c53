//! ResourcesBridge wire protocol: request and response envelopes.
//!
//! Every variant is encoded as an object carrying an integer `rawValue` discriminant
//! plus the fields associated with that variant:
//!
//! ```text
//! Request  = { "rawValue": 0|1|2, "associatedValue": <path> }
//! Status   = { "rawValue": 0 } | { "rawValue": 1, "associatedValue": <message> }
//! Response = { "rawValue": 0, "associatedRequest": Request, "associatedStatus": Status }
//!          | { "rawValue": 1, "associatedError": <message> }
//! ```
//!
//! The layout is versionless. An unknown discriminant or a missing associated field
//! is a decode error for that one message.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Request sent by a bridge to the monitor. Equality (variant + path) is what
/// correlates an `Ack` with the request that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRequest", into = "RawRequest")]
pub enum Request {
    /// Does a readable resource exist at this path?
    CheckAvailability(String),
    /// Stream the resource at this path back to the requester.
    GetResource(String),
    /// Accept an upload that will be written to this path.
    SendResource(String),
}

impl Request {
    const CHECK_AVAILABILITY: u8 = 0;
    const GET_RESOURCE: u8 = 1;
    const SEND_RESOURCE: u8 = 2;

    /// Resource path carried by the request.
    pub fn path(&self) -> &str {
        match self {
            Request::CheckAvailability(path)
            | Request::GetResource(path)
            | Request::SendResource(path) => path,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::CheckAvailability(_) => "check-availability",
            Request::GetResource(_) => "get-resource",
            Request::SendResource(_) => "send-resource",
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.path())
    }
}

/// Outcome carried by an `Ack`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawStatus", into = "RawStatus")]
pub enum Status {
    Success,
    Error(String),
}

impl Status {
    const SUCCESS: u8 = 0;
    const ERROR: u8 = 1;

    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }
}

/// Response sent by the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawResponse", into = "RawResponse")]
pub enum Response {
    /// Reply to a specific request.
    Ack(Request, Status),
    /// Reply not tied to any request, e.g. the request could not be decoded.
    ProtocolError(String),
}

impl Response {
    const ACK: u8 = 0;
    const PROTOCOL_ERROR: u8 = 1;
}

/// Discriminant outside the known range, or a variant missing its associated field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("unknown {kind} discriminant {raw_value}")]
    UnknownDiscriminant { kind: &'static str, raw_value: u64 },
    #[error("{kind} discriminant {raw_value} is missing field `{field}`")]
    MissingField {
        kind: &'static str,
        raw_value: u64,
        field: &'static str,
    },
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRequest {
    raw_value: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    associated_value: Option<String>,
}

impl From<Request> for RawRequest {
    fn from(request: Request) -> Self {
        let (raw_value, path) = match request {
            Request::CheckAvailability(path) => (Request::CHECK_AVAILABILITY, path),
            Request::GetResource(path) => (Request::GET_RESOURCE, path),
            Request::SendResource(path) => (Request::SEND_RESOURCE, path),
        };
        RawRequest {
            raw_value: raw_value.into(),
            associated_value: Some(path),
        }
    }
}

impl TryFrom<RawRequest> for Request {
    type Error = EnvelopeError;

    fn try_from(raw: RawRequest) -> Result<Self, Self::Error> {
        let wrap: fn(String) -> Request = match raw.raw_value {
            v if v == u64::from(Request::CHECK_AVAILABILITY) => Request::CheckAvailability,
            v if v == u64::from(Request::GET_RESOURCE) => Request::GetResource,
            v if v == u64::from(Request::SEND_RESOURCE) => Request::SendResource,
            raw_value => {
                return Err(EnvelopeError::UnknownDiscriminant {
                    kind: "request",
                    raw_value,
                })
            }
        };
        let path = raw
            .associated_value
            .ok_or(EnvelopeError::MissingField {
                kind: "request",
                raw_value: raw.raw_value,
                field: "associatedValue",
            })?;
        Ok(wrap(path))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStatus {
    raw_value: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    associated_value: Option<String>,
}

impl From<Status> for RawStatus {
    fn from(status: Status) -> Self {
        match status {
            Status::Success => RawStatus {
                raw_value: Status::SUCCESS.into(),
                associated_value: None,
            },
            Status::Error(message) => RawStatus {
                raw_value: Status::ERROR.into(),
                associated_value: Some(message),
            },
        }
    }
}

impl TryFrom<RawStatus> for Status {
    type Error = EnvelopeError;

    fn try_from(raw: RawStatus) -> Result<Self, EnvelopeError> {
        match raw.raw_value {
            v if v == u64::from(Status::SUCCESS) => Ok(Status::Success),
            v if v == u64::from(Status::ERROR) => raw
                .associated_value
                .map(Status::Error)
                .ok_or(EnvelopeError::MissingField {
                    kind: "status",
                    raw_value: v,
                    field: "associatedValue",
                }),
            raw_value => Err(EnvelopeError::UnknownDiscriminant {
                kind: "status",
                raw_value,
            }),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResponse {
    raw_value: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    associated_request: Option<Request>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    associated_status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    associated_error: Option<String>,
}

impl From<Response> for RawResponse {
    fn from(response: Response) -> Self {
        match response {
            Response::Ack(request, status) => RawResponse {
                raw_value: Response::ACK.into(),
                associated_request: Some(request),
                associated_status: Some(status),
                associated_error: None,
            },
            Response::ProtocolError(message) => RawResponse {
                raw_value: Response::PROTOCOL_ERROR.into(),
                associated_request: None,
                associated_status: None,
                associated_error: Some(message),
            },
        }
    }
}

impl TryFrom<RawResponse> for Response {
    type Error = EnvelopeError;

    fn try_from(raw: RawResponse) -> Result<Self, Self::Error> {
        let missing = |raw_value: u64, field: &'static str| EnvelopeError::MissingField {
            kind: "response",
            raw_value,
            field,
        };
        match raw.raw_value {
            v if v == u64::from(Response::ACK) => {
                let request = raw
                    .associated_request
                    .ok_or_else(|| missing(v, "associatedRequest"))?;
                let status = raw
                    .associated_status
                    .ok_or_else(|| missing(v, "associatedStatus"))?;
                Ok(Response::Ack(request, status))
            }
            v if v == u64::from(Response::PROTOCOL_ERROR) => raw
                .associated_error
                .map(Response::ProtocolError)
                .ok_or_else(|| missing(v, "associatedError")),
            raw_value => Err(EnvelopeError::UnknownDiscriminant {
                kind: "response",
                raw_value,
            }),
        }
    }
}
