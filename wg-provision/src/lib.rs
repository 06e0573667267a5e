// WireGuard hub-and-spoke provisioning library
// Shared modules for the CLI and tests

#![warn(missing_docs)]

//! WireGuard Hub-and-Spoke Provisioning Library
//!
//! This library turns an ordered client roster into addresses, key material
//! and WireGuard configuration documents, and delivers the server side of
//! the result to an OpenBSD host.
//!
//! # Main Components
//!
//! - [`allocator`]: Ordinal to address mapping
//! - [`config`]: Configuration file parsing and validation
//! - [`error`]: Error kinds of the provisioning core
//! - [`firewall`]: PF ruleset rendering
//! - [`host`]: Command execution and file transfer on the server
//! - [`inspect`]: Host facts and uplink discovery
//! - [`keystore`]: Idempotent key material store
//! - [`provision`]: Orchestration of a provisioning run
//! - [`render`]: Server and client document rendering
//! - [`sysctl`]: Idempotent `sysctl.conf` edits
//! - [`tools`]: `wg` and `qrencode` adapters
//! - [`types`]: Shared data structures

pub mod allocator;
pub mod config;
pub mod error;
pub mod firewall;
pub mod host;
pub mod inspect;
pub mod keystore;
pub mod provision;
pub mod render;
pub mod sysctl;
pub mod tools;
pub mod types;
