use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("packet too short: {0} bytes")]
    Truncated(usize),

    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    #[error("tracker reported: {0}")]
    Reported(String),
}
