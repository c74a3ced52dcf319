pub mod activity_log;
pub mod configuration;
pub mod controller;
pub mod error_handling;
pub mod remote;
pub mod resilience;
pub mod session_management;
pub mod storage;
pub mod transfer;
pub mod web_interface;

pub use controller::*;
