pub mod config;
pub mod coordinator;
pub mod dashboard;
pub mod error;
pub mod net;
pub mod protocol;
pub mod shutdown;
pub mod worker;
