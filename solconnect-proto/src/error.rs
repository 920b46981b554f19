use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame length exceeds the per-connection maximum")]
    FrameTooLarge,
    #[error("frame body could not be decoded")]
    MalformedFrame,
    #[error("connection closed while reading a frame")]
    ConnectionClosed,
    #[error("io error while reading or writing a frame")]
    Io,
}
