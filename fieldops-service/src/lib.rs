//! fieldops-service: quote, job and invoice lifecycle with payment webhook ingestion.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
pub mod utils;
