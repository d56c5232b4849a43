pub mod config;
pub mod device;
pub mod discovery;
pub mod errors;
pub mod hub;
pub mod metrics;
pub mod model;
pub mod rest;
pub mod source;
pub mod ws;
