pub mod background_task;
pub mod controller_handler;
pub mod output_hub;
pub mod proxy_service;

pub use controller_handler::Controller;
pub use proxy_service::ProxyService;
