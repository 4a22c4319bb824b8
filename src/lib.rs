pub mod config;
pub mod dashboard;
pub mod error;
pub mod manager;
pub mod registry;
pub mod service;
pub mod shutdown;
pub mod store;
pub mod timer;
pub mod worker;
