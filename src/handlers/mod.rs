//! # HTTP Request Handlers
//!
//! One module per endpoint group:
//! - **transcribe**: `POST /transcribe`, the synchronous job entry point
//! - **progress**: `GET /progress`, `GET /progress/{job_id}`,
//!   `POST /cleanup`
//! - **models**: `GET /models`

pub mod models;
pub mod progress;
pub mod transcribe;
