//! Object detection job service
//!
//! Runs a YOLO detector over uploaded images, videos, image batches and live
//! streams, persists annotated outputs and label files, and exposes per-job
//! status for polling clients.

pub mod app_state;
pub mod config;
pub mod jobs;
pub mod models;
pub mod routes;
pub mod services;
