//! Core library: media ingestion pipeline, normalization and job tracking.

pub mod config;
pub mod error;
pub mod journal;
pub mod models;
pub mod normalizer;
pub mod pipeline;
pub mod retry;
pub mod scanner;
pub mod tracker;

pub use error::{StatusError, SubmitError};
pub use models::{Failure, FailureKind, JobState, MediaItem};
pub use pipeline::{IngestionPipeline, PipelineOptions, SubmitRequest};
