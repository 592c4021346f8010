//! Core engine for the backy backup application.
//!
//! Splits sources into content-defined chunks, addresses each chunk by its
//! digest, stores chunk bodies without duplication, and ships the chunk set
//! to a local directory, an SFTP host, or an external snapshot repository.
//! The UI layer drives everything through [`api::Engine`] and observes jobs
//! only via progress events.

pub mod api;
pub mod chunker;
pub mod config;
pub mod job;
pub mod manifest;
pub mod snapshot;
pub mod store;
pub mod transport;

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;
