//! Command control plane for the Mehrak game-statistics bot.
//!
//! Every interactive command goes through [`pipeline::CommandPipeline`]:
//! a per-user leaky bucket ([`admission`]), a passphrase handshake that yields
//! a decrypted game token ([`auth`]), and a bounded worker pool that runs the
//! command's engine ([`dispatch`]). Storage, decryption, the chat platform and
//! the business logic itself sit behind the traits in [`ports`].

pub mod admission;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod memory;
pub mod metrics;
pub mod pipeline;
pub mod ports;

pub use errors::{Error, Result};
