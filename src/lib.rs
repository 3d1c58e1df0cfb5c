//! POD OCR Pipeline
//!
//! Queue-based ingestion-to-inference pipeline for delivery photos: an axum
//! producer accepts images and enqueues jobs, a broker (Redis or in-process)
//! provides at-least-once delivery with visibility timeouts, and an
//! autoscaled worker pool batches images through an OCR backend, extracts
//! structured address fields, and persists results to PostgreSQL.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod worker;
