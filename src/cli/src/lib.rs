//! skiff CLI - copy container images between storage mechanisms.

pub mod commands;
