//! # GridFire Server
//!
//! HTTP surface and process wiring for the GridFire audio pipeline.
//!
//! - **Uploads**: lossless sources are streamed from a multipart body
//!   straight into encrypted object storage and queued for encoding.
//! - **Track slots**: owners add, delete and reorder the tracks of a release.
//! - **Streaming reads**: the player resolves init and segment byte ranges
//!   for packaged tracks.
//! - **Events**: progress and status for the caller's tracks over SSE.
//!
//! The same binary runs pipeline workers, either embedded next to the API
//! or as a dedicated `worker` process sharing the Postgres queue.

pub mod handlers;
pub mod infra;
pub mod routes;

pub use infra::app_state::AppState;
pub use infra::errors::{AppError, AppResult};
