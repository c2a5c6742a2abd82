use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Destination already exists: {0}")]
    Collision(String),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<image::ImageError> for ShotError {
    fn from(e: image::ImageError) -> Self {
        ShotError::Image(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ShotError {
    fn from(e: tokio::task::JoinError) -> Self {
        ShotError::Io(std::io::Error::other(e))
    }
}

pub type Result<T> = std::result::Result<T, ShotError>;
