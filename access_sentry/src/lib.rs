pub mod authorization;
pub mod backend;
pub mod config;
pub mod control;
pub mod event_logger;
pub mod events;
pub mod face;
pub mod frame_buffer;
pub mod metrics;
pub mod mjpeg;
pub mod orchestrator;
pub mod plate_detection;
pub mod rate_limit;
pub mod registry;
pub mod server;
pub mod store;
