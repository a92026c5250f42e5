pub mod config;
pub mod logging;
pub mod models;
pub mod naming;
pub mod orchestration;
pub mod persistence;
pub mod sqlite;
