//! ViperGrid Backend Library
//!
//! Exposes core modules for use by the binary and integration tests.

pub mod api;
pub mod config;
pub mod game;
pub mod gateway;
pub mod ledger;
pub mod manager;
pub mod middleware;
pub mod models;
pub mod settlement;
