pub mod backend;
pub mod chart;
pub mod command;
pub mod config;
pub mod gesture;
pub mod grid;
pub mod interval;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod store;
pub mod sync;
