pub mod api;
pub mod artifacts;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod errors;
pub mod gateway;
pub mod logs;
pub mod observability;
pub mod proxy;
pub mod registry;
pub mod server;
