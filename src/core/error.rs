//! Error taxonomy for the frame cache
//!
//! `FrameError` is `Clone` so that one fetch outcome can be handed to every
//! request that joined the same in-flight operation.

use std::sync::Arc;
use thiserror::Error;

use crate::entities::DecodeError;

pub type Result<T, E = FrameError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error)]
pub enum FrameError {
    /// Frame filter string is not of the form `step=N`
    #[error("invalid frame filter '{0}'")]
    InvalidFrameFilter(String),

    /// Server metadata violates a structural invariant
    #[error("invalid frame metadata: {0}")]
    InvalidMetadata(String),

    /// Data frame number is outside the job or not among its included frames
    #[error("frame {0} doesn't belong to the job")]
    FrameOutOfJob(i64),

    /// A newer request superseded this one. Payload is the requested frame.
    #[error("request for frame {0} is outdated")]
    Stale(i64),

    /// Network collaborator failed
    #[error("{what} failed: {cause:#}")]
    Fetch {
        what: &'static str,
        cause: Arc<anyhow::Error>,
    },

    /// Decoder rejected a chunk
    #[error("failed to decode chunk {chunk}: {message}")]
    Decode { chunk: usize, message: String },

    /// Per-job state accessed before any frame was requested
    #[error("frame data was not initialized for job {0}, request any frame first")]
    NotInitialized(u64),

    /// Job cache was cleared while the request was running
    #[error("frame cache for job {0} was closed")]
    JobClosed(u64),
}

impl FrameError {
    pub(crate) fn fetch(what: &'static str, err: anyhow::Error) -> Self {
        FrameError::Fetch {
            what,
            cause: Arc::new(err),
        }
    }

    pub(crate) fn from_decode(err: DecodeError, chunk: usize, frame: i64) -> Self {
        match err {
            DecodeError::Outdated => FrameError::Stale(frame),
            DecodeError::Failed(message) => FrameError::Decode { chunk, message },
        }
    }

    /// Stale outcomes mean a newer answer is on its way; callers retry with
    /// the frame they currently want instead of reporting an error.
    pub fn is_stale(&self) -> bool {
        matches!(self, FrameError::Stale(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_mapping() {
        assert!(FrameError::from_decode(DecodeError::Outdated, 3, 42).is_stale());
        match FrameError::from_decode(DecodeError::Failed("bad header".into()), 3, 42) {
            FrameError::Decode { chunk, message } => {
                assert_eq!(chunk, 3);
                assert_eq!(message, "bad header");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_fetch_error_keeps_context() {
        let err = anyhow::anyhow!("connection reset").context("GET /jobs/1/data");
        let frame_err = FrameError::fetch("chunk fetch", err);
        let text = frame_err.to_string();
        assert!(text.contains("chunk fetch failed"));
        assert!(text.contains("connection reset"));
        assert!(!frame_err.is_stale());
    }
}
