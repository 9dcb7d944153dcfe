pub mod auth;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod error;
pub mod group_pages;
pub mod liveness;
pub mod metrics;
pub mod model;
pub mod persistence;
pub mod reconcile;
pub mod registry;
pub mod router;
pub mod routes;
pub mod state;
pub mod telemetry;
pub mod ws;
