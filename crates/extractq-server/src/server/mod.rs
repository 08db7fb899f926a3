pub mod cache;
pub mod config;
pub mod gateway;
pub mod notify;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod storage;
pub mod telemetry;
