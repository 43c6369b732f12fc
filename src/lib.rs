//! # lfs-server
//!
//! Git LFS server in Rust.
//!
//! This crate provides:
//! - Pluggable object storage (local disk, memory, S3, Azure Blob, Google
//!   Cloud Storage, Google Drive)
//! - A content-addressed store that verifies size and SHA-256 on every write
//! - The LFS Batch, transfer and File Locking HTTP APIs on axum
//! - The `git-lfs-transfer` pkt-line protocol for SSH
//! - Resumable chunked uploads, also used for CI artifacts
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use lfs_server::content_store::ContentStore;
//! use lfs_server::storage::MemoryStorage;
//! use lfs_server::Pointer;
//!
//! let store = ContentStore::new(Arc::new(MemoryStorage::new()));
//! let content = b"Hello, this is a large file";
//! let pointer = Pointer::from_content(content);
//! store.put(&pointer, &mut &content[..]).unwrap();
//! assert!(store.verify(&pointer).unwrap());
//! ```

mod error;
mod oid;
mod pointer;

pub mod artifacts;
pub mod batch;
pub mod chunks;
pub mod config;
pub mod content_store;
pub mod lock;
pub mod meta;
pub mod range;
pub mod repo;
pub mod server;
pub mod service;
pub mod storage;
pub mod telemetry;
pub mod token;
pub mod transfer;

pub use error::{Error, Result};
pub use oid::{HashingReader, Oid};
pub use pointer::Pointer;
