//! Storage module for persistent data storage
//!
//! Provides SQLite-based persistence for document metadata and job outcomes.

mod database;

pub use database::DocumentDb;
