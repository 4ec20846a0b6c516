// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! JSON codec for request/response envelopes.
//!
//! Decoding is strict: a payload that parses but breaks an envelope rule
//! (e.g. non-increasing sequence ids within one response) is rejected with
//! [`CodecError::InvalidMessage`] instead of being handed to the handler.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use super::message::{RequestKind, SyncRequest, SyncResponse};

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

pub fn encode_request(request: &SyncRequest) -> Result<String, CodecError> {
    encode("request", request)
}

pub fn decode_request(payload: &str) -> Result<SyncRequest, CodecError> {
    let request: SyncRequest = decode("request", payload)?;
    if let RequestKind::Resend { from, to } = request.kind {
        if from > to {
            return Err(CodecError::InvalidMessage(format!(
                "resend range {}..={} is empty",
                from, to
            )));
        }
    }
    Ok(request)
}

pub fn encode_response(response: &SyncResponse) -> Result<String, CodecError> {
    encode("response", response)
}

pub fn decode_response(payload: &str) -> Result<SyncResponse, CodecError> {
    let response: SyncResponse = decode("response", payload)?;
    for pair in response.messages.windows(2) {
        if pair[1].sequence_id <= pair[0].sequence_id {
            return Err(CodecError::InvalidMessage(format!(
                "sequence ids not increasing within response: {} then {}",
                pair[0].sequence_id, pair[1].sequence_id
            )));
        }
    }
    Ok(response)
}

fn encode<T: Serialize>(what: &'static str, value: &T) -> Result<String, CodecError> {
    let payload = serde_json::to_string(value)?;
    crate::metrics::record_payload_bytes(what, "encode", payload.len());
    Ok(payload)
}

fn decode<T: DeserializeOwned>(what: &'static str, payload: &str) -> Result<T, CodecError> {
    crate::metrics::record_payload_bytes(what, "decode", payload.len());
    serde_json::from_str(payload).map_err(|e| {
        crate::metrics::record_error("codec", what);
        CodecError::from(e)
    })
}
