//! End-to-end cleanup scenarios.
//!
//! Each test wires a [`RunCoordinator`](crate::retention::RunCoordinator)
//! or one of the purgers to in-memory stores, the same way the worker does
//! against real backends.
