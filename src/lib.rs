pub mod config;
pub mod engine;
pub mod gateway;
pub mod limits;
pub mod model;
pub mod observability;
pub mod policy;
pub mod pricing;
pub mod reaper;
pub mod settings;
pub mod settlement;
pub mod wal;
