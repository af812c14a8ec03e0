use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("io eof")]
    ErrIoEof,
    #[error("io: read/write on closed pipe")]
    ErrClosedPipe,
    #[error("layer switch is already pending")]
    ErrSpatialLayerBusy,
    #[error("requested spatial layer not found")]
    ErrSpatialLayerNotFound,
    #[error("down track is not bound")]
    ErrNotBound,
    #[error("no receiver found")]
    ErrNoReceiverFound,

    #[error("{0}")]
    Buffer(#[from] buffer::Error),
    #[error("{0}")]
    Rtcp(#[from] rtcp::Error),
    #[error("{0}")]
    Util(#[from] util::Error),

    #[error("{0}")]
    Other(String),
}
