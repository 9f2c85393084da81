//! # GridFire Core
//!
//! The audio ingestion and transcoding pipeline behind GridFire.
//!
//! A lossless upload is streamed, encrypted, into object storage and then
//! moves through three queued stages:
//!
//! - **encodeFLAC**: the source becomes an encrypted archival FLAC.
//! - **transcodeAAC**: the FLAC becomes a fragmented MP4, packaged into an
//!   init segment, byte-range media segments and an HLS playlist.
//! - **transcodeMP3**: the FLAC becomes an encrypted MP3 download copy.
//!
//! Track status only ever moves along the state machine in
//! [`gridfire_model::TrackStatus`], and every collaborator (object store,
//! key store, engine, queue, repository, notifier) sits behind a trait so
//! the whole pipeline runs in-process for tests.
//!
//! ## Feature Flags
//!
//! - `database`: Postgres repositories, queue and key store, Redis fan-out
//! - `s3`: S3-compatible object storage
//! - `test-support`: fake engine, recording notifier and fMP4 fixtures

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod crypto;
pub mod error;
pub mod notify;
pub mod packager;
pub mod pipeline;
pub mod queue;
pub mod storage;
pub mod tracks;
pub mod transcode;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use error::{ErrorClass, PipelineError, Result};
pub use pipeline::{
    JobOutcome, Pipeline, PipelineDeps, ScratchSpace, UploadReceipt, UploadRequest,
    WorkerPool, WorkerSettings,
};

#[cfg(feature = "database")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
