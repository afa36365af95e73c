#![forbid(unsafe_code)]

//! Library behind the mediagrab binaries.
//!
//! A request names a URL and a format; [`retrieval::JobRunner`] hands it to
//! the extraction engine (`yt-dlp`), finds the file it produced, and renames
//! it after the sanitized title. [`server`] exposes that over HTTP and
//! [`store`] serves the finished files back.

pub mod config;
pub mod engine;
pub mod error;
pub mod naming;
pub mod retrieval;
pub mod security;
pub mod server;
pub mod store;
