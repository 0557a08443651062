pub mod config;
pub mod dispatcher;
pub mod error;
pub mod feedback;
pub mod lifecycle;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod terminal;
pub mod vault;
pub mod worker;
