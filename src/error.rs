/// Errors surfaced by the volume engine.
#[derive(Debug, thiserror::Error)]
pub enum VolumeError {
    #[error("unknown asset: {0}")]
    UnknownAsset(String),

    #[error("unknown asset pair: {0}")]
    UnknownAssetPair(String),

    #[error("invalid range: from {from} is after to {to}")]
    InvalidRange { from: String, to: String },

    /// Store, registry or channel I/O failure. Never handled by the aggregator; the inbound
    /// consumer's retry/dead-letter policy decides what happens to the batch.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl VolumeError {
    pub fn storage(msg: impl Into<String>) -> Self {
        VolumeError::Storage(msg.into())
    }

    /// Caller-visible rejection, as opposed to a transient dependency failure.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, VolumeError::Storage(_))
    }
}

pub type VolumeResult<T> = Result<T, VolumeError>;
