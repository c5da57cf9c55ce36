pub mod aggregator_subs;
pub mod client_handler;
pub mod config;
pub mod roster;
pub mod upstream;
