pub mod bar_engine;
pub mod client_handler;
pub mod config;
pub mod subscription_manager;
pub mod upstream;
