pub mod advisor;
pub mod checkpoint;
pub mod config;
pub mod env;
pub mod errors;
pub mod heartbeat;
pub mod logging;
pub mod pipeline;
pub mod process;
pub mod quality;
pub mod scheduler;
pub mod template;
pub mod tracker;
pub mod ui;
pub mod util;
