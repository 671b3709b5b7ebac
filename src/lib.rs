pub mod config;
pub mod dap;
pub mod engine;
pub mod error;
pub mod lang;
pub mod log;
pub mod mem_limit;
pub mod session;
pub mod terminal;
