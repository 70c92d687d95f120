mod common;
mod engine_tests;
mod record_store_tests;
