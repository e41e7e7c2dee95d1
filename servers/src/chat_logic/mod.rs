pub mod config;
pub mod logger;
pub mod model;
pub mod state;
pub mod cache;
pub mod buffer;
pub mod registry;
pub mod relay;
pub mod flusher;
pub mod monitor;
pub mod downstream;
