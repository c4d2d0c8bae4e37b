pub mod availability;
pub mod backoff;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod error;
pub mod executor;
pub mod jobs;
pub mod lifecycle;
pub mod limits;
pub mod maintenance;
pub mod model;
pub mod notify;
pub mod observability;
pub mod processor;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod validator;
pub mod wal;
