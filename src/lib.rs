//! SmartMic - headless client for the SmartMic microphone-sharing server
//!
//! This crate joins and reconciles mic rooms, publishes the local
//! microphone over WebRTC, and drives the server's shared keyboard.

pub mod api;
pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod health;
pub mod join;
pub mod media;
pub mod metrics;
pub mod reconcile;
pub mod reconnect;
pub mod rooms;
pub mod session;
pub mod utils;

pub use client::MicClient;
pub use error::{AppError, Result};
