//! Junction Engine: routes sensor readings from sources to devices, screens
//! and outbound services over HTTP, MQTT, WebSocket and serial.

pub mod catalog;
pub mod collectors;
pub mod config;
pub mod cron;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod health;
pub mod http;
pub mod models;
pub mod notifications;
pub mod payload;
pub mod scheduler;
pub mod sensors;
pub mod state;
pub mod status;
pub mod store;
pub mod supervisor;
pub mod transport;

pub use engine::{Engine, Runtime};
pub use error::{EngineError, EngineResult, ErrorKind};
