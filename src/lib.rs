//! Retention cleanup engine for the school-management app backend.
//!
//! The engine periodically (or on request from the admin app) deletes
//! expired chat messages and announcements from the document store and
//! expired media from S3-compatible object storage. See [`retention`] for
//! the engine itself; the remaining modules are its storage backends,
//! configuration and observability.

pub mod config;
pub mod db;
pub mod object_store;
pub mod observability;
pub mod retention;

#[cfg(test)]
mod tests;
