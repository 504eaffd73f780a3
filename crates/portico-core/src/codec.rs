//! Envelope codec
//!
//! Envelopes travel as MessagePack maps with named keys
//! (`type`, `category`, `args`). Decoding re-applies the lower-case
//! rule so a peer sending `"PING"` is still dispatched as `ping`.

use crate::envelope::Envelope;
use crate::Result;
use bytes::Bytes;

/// Encode an envelope to MessagePack
pub fn encode(envelope: &Envelope) -> Result<Bytes> {
    let buf = rmp_serde::to_vec_named(envelope)?;
    Ok(Bytes::from(buf))
}

/// Decode an envelope from MessagePack
pub fn decode(data: &[u8]) -> Result<Envelope> {
    let envelope: Envelope = rmp_serde::from_slice(data)?;
    Ok(envelope.normalize())
}

/// Decode an envelope from JSON text (used for MQTT payloads)
pub fn decode_json(data: &[u8]) -> Result<Envelope> {
    let envelope: Envelope = serde_json::from_slice(data)
        .map_err(|e| crate::Error::DecodeError(e.to_string()))?;
    Ok(envelope.normalize())
}

/// Encode an envelope to JSON text
pub fn encode_json(envelope: &Envelope) -> Result<Bytes> {
    let buf =
        serde_json::to_vec(envelope).map_err(|e| crate::Error::EncodeError(e.to_string()))?;
    Ok(Bytes::from(buf))
}
