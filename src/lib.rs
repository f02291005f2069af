pub mod config;
pub mod household;
pub mod telegram_log;
