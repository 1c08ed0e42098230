#![forbid(unsafe_code)]

// Signaling error taxonomy, reported to the calling connection only

use crate::media::types::{
    ConsumerId, LectureId, MediaError, ProducerId, TransportId,
};
use serde::{Deserialize, Serialize};

/// Coarse error class sent to clients as `code`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Forbidden,
    EngineFailure,
    InvalidRequest,
}

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("Room already exists for lecture {0}")]
    AlreadyExists(LectureId),

    #[error("Room not found for lecture {0}")]
    RoomNotFound(LectureId),

    #[error("Room for lecture {0} has no router")]
    NoRouter(LectureId),

    #[error("Not joined to this lecture")]
    NoPeer,

    #[error("Transport not found: {0}")]
    TransportNotFound(TransportId),

    #[error("Producer not found: {0}")]
    ProducerNotFound(ProducerId),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(ConsumerId),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Media engine error: {0}")]
    Engine(#[from] MediaError),
}

impl SignalingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RoomNotFound(_)
            | Self::NoPeer
            | Self::NoRouter(_)
            | Self::TransportNotFound(_)
            | Self::ProducerNotFound(_)
            | Self::ConsumerNotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Engine(_) => ErrorKind::EngineFailure,
        }
    }
}

pub type SignalingResult<T> = Result<T, SignalingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            SignalingError::RoomNotFound(LectureId::new("l")).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            SignalingError::AlreadyExists(LectureId::new("l")).kind(),
            ErrorKind::AlreadyExists
        );
        assert_eq!(
            SignalingError::from(MediaError::ProducerError("x".into())).kind(),
            ErrorKind::EngineFailure
        );
    }

    #[test]
    fn test_kind_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::EngineFailure).unwrap(),
            "\"engine-failure\""
        );
    }
}
