use thiserror::Error;

/// Errors raised while encoding outbound messages or decoding inbound
/// commands on the AOA wire protocol.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("failed to encode outbound message: {0}")]
    Encode(serde_json::Error),

    #[error("failed to decode inbound command: {0}")]
    Decode(serde_json::Error),
}
