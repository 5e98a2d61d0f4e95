pub mod audit;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod resolver;
pub mod rest;
pub mod service;
