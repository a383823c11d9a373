//! Unit tests for individual components

mod config_test;
mod error_test;
mod models_test;
mod keys_test;
mod util_test;
