//! Manuscript conversion service
//!
//! This library provides the orchestration core behind the manuscript-convert
//! server: uploaded PDF/EPUB manuscripts are stored in a blob store, handed to
//! an external converter process, and the produced artifacts are stored and
//! recorded on the job while progress is relayed to connected clients.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
