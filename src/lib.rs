//! AI image-edit processing service
//!
//! This library provides the processing core behind the image-edit API:
//! admission control, per-backend circuit breaking, retry policy, the staged
//! job orchestrator and progress reporting, with Cloudflare Workers AI as the
//! generative backend.

pub mod app_state;
pub mod config;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
