pub mod broadcaster;
pub mod client_handler;
pub mod config;
pub mod upstream;
