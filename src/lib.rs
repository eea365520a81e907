// ===============================
// src/lib.rs
// ===============================
pub mod binance;
pub mod client;
pub mod config;
pub mod domain;
pub mod engine;
pub mod environment;
pub mod error;
pub mod feed;
pub mod gateway;
pub mod listing;
pub mod metrics;
pub mod paper;
pub mod positions;
pub mod recorder;
pub mod risk;
pub mod safety;
pub mod store;
pub mod weight;

#[cfg(test)]
mod testkit;
