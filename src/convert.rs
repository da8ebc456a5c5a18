use serde_json::{json, Value};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::AppError;
use crate::result::Result;

/// Envelope payloads keep the original wire shape: the description or
/// candidate nested under a single key named after the signal kind.
pub fn offer_payload(offer: &RTCSessionDescription) -> Result<Value> {
    Ok(json!({ "offer": offer }))
}

pub fn answer_payload(answer: &RTCSessionDescription) -> Result<Value> {
    Ok(json!({ "answer": answer }))
}

pub fn candidate_payload(candidate: &RTCIceCandidateInit) -> Result<Value> {
    Ok(json!({ "candidate": candidate }))
}

pub fn offer_from_payload(payload: &Value) -> Result<RTCSessionDescription> {
    description_from_payload(payload, "offer")
}

pub fn answer_from_payload(payload: &Value) -> Result<RTCSessionDescription> {
    description_from_payload(payload, "answer")
}

pub fn candidate_from_payload(payload: &Value) -> Result<RTCIceCandidateInit> {
    let value = payload
        .get("candidate")
        .ok_or(AppError::throw("payload has no candidate"))?;
    Ok(serde_json::from_value(value.clone())?)
}

fn description_from_payload(payload: &Value, key: &str) -> Result<RTCSessionDescription> {
    let value = payload
        .get(key)
        .ok_or(AppError::throw(format!("payload has no {}", key)))?;
    Ok(serde_json::from_value(value.clone())?)
}
