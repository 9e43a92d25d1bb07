//! Convert Worker Library
//!
//! Consumes conversion tasks from RabbitMQ work queues, downloads each source
//! file, converts it with external tools (office renderer, image rasterizer,
//! video transcoder) and streams the results back to the caller with a chunked
//! upload protocol finished by a completion callback.
//!
//! ## Module Overview
//!
//! - `broker`: broker traits and the RabbitMQ implementation
//! - `worker`: pool of queue consumers with graceful shutdown
//! - `handler`: delivery parsing and command selection
//! - `pipeline`: validate, download, convert, upload, complete
//! - `command`: document and video conversion commands
//! - `transfer`: capped download and chunked upload
//! - `telemetry`: OpenTelemetry integration and structured logging

pub mod broker;
pub mod command;
pub mod config;
pub mod error;
pub mod handler;
pub mod pipeline;
pub mod retry;
pub mod shutdown;
pub mod task;
pub mod telemetry;
pub mod temp_files;
pub mod tools;
pub mod transfer;
pub mod worker;
