//! Persistence plumbing shared by definition and instance storage

pub mod database;

pub use database::Database;
