pub mod constants;
pub mod session;
pub mod signal;
pub mod types;
