//! # Transcription Pipeline Modules
//!
//! The core of the service: the engine abstraction and its Whisper
//! implementation, the model catalog, and the job machinery (retry
//! controller, segment scheduler, assembler, pipeline driver).

pub mod assembler;
pub mod engine;
pub mod model;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod whisper;
