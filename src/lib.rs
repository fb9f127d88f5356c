pub mod application;
pub mod bus;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod strategies;
