pub mod cli;
pub mod config;
pub mod director;
pub mod instrument;
pub mod loader;
pub mod message;
pub mod rapl;
pub mod run;
pub mod sensor;
pub mod timer;
pub mod topology;
