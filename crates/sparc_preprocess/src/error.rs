use thiserror::Error;

pub type Result<T> = std::result::Result<T, PreprocessError>;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("Unsupported background method '{0}'")]
    UnknownMethod(String),

    #[error("Channel selection cannot be empty")]
    EmptyChannelSelection,

    #[error("Channel {index} out of range for image with {available} channels")]
    ChannelOutOfRange { index: usize, available: usize },

    #[error("Invalid array shape: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Failed to read plane c={c} z={z}: {message}")]
    Source { c: usize, z: usize, message: String },

    #[error("Failed to write plane c={c} z={z}: {message}")]
    Sink { c: usize, z: usize, message: String },

    #[error("Failed to start thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
