//! The `git-lfs-transfer` protocol spoken over SSH.
//!
//! See https://github.com/git-lfs/git-lfs/blob/main/docs/proposals/ssh_adapter.md

pub mod command;
pub mod pktline;
pub mod status;
mod session;

pub use command::{Command, Request};
pub use pktline::{Packet, PktReader, PktWriter};
pub use session::Session;
pub use status::Status;
