//! Inventory service: per-SKU stock reservations driven by broker messages
//! with at-least-once delivery.

pub mod api;
pub mod availability;
pub mod backoff;
pub mod config;
pub mod consumer;
pub mod error;
pub mod handlers;
pub mod kafka;
pub mod models;
pub mod reliability;
pub mod reservation;
pub mod schema;
pub mod store;
pub mod supervisor;
