pub mod client;
pub mod config;

pub use client::{MqttError, MqttEvent, MqttService};
pub use config::MqttConfig;
