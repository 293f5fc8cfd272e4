pub mod backup_exchange;
pub mod core;
pub mod grading;
pub mod grading_config;
pub mod promotions;
