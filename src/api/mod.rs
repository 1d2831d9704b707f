//! API client module for the booking backend

pub mod client;

pub use client::{ApiClient, ApiError};
