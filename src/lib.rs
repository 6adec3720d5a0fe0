//! Saju analysis gateway
//!
//! Web tier that starts long-running analyses on the external analysis
//! backend, charges and refunds credits, and relays job progress to clients
//! through a polling API.

pub mod app_state;
pub mod auth;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
