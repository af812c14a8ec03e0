use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("packet not found in cache")]
    ErrPacketNotFound,
    #[error("buffer too small")]
    ErrBufferTooSmall,
    #[error("packet too old")]
    ErrPacketTooOld,
    #[error("packet already received")]
    ErrRtxPacket,
    #[error("packet is too large to store")]
    ErrPacketTooLarge,
    #[error("packet is not large enough")]
    ErrShortPacket,
    #[error("invalid nil packet")]
    ErrNilPacket,
    #[error("io eof")]
    ErrIoEof,

    #[error("{0}")]
    Util(#[from] util::Error),

    #[error("{0}")]
    Other(String),
}
