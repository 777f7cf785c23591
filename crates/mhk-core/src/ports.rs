//! Hexagonal ports for the collaborators the control plane talks to.
//!
//! Storage, crypto, the chat transport and the per-command business logic all
//! live behind these traits; adapter crates (Discord gateway, Redis, Postgres)
//! implement them. In-process reference implementations live in [`crate::memory`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    dispatch::{CommandOutput, ExecutionContext},
    domain::{EncryptedSecret, InteractionRef, SecretMaterial, StoredCredential, Subject, Token},
    Result,
};

/// Enrolled profile lookup.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` when the user never enrolled this profile.
    async fn get(&self, subject: &Subject) -> Result<Option<StoredCredential>>;
}

/// Decryption failed because the supplied material does not match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("secret material does not match")]
pub struct InvalidSecret;

pub trait Cipher: Send + Sync {
    fn decrypt(
        &self,
        secret: &EncryptedSecret,
        material: &SecretMaterial,
    ) -> std::result::Result<Token, InvalidSecret>;
}

/// Cross-instance token cache (Redis in production).
///
/// `set` must be atomic per key; readers never see a half-written entry.
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Token>>;
    async fn set(&self, key: &str, token: Token, ttl: Duration) -> Result<()>;
}

/// The chat-side half of the passphrase handshake.
#[async_trait]
pub trait InteractiveChannel: Send + Sync {
    /// Ask the user for their passphrase (a modal, DM, force-reply...).
    ///
    /// Fire-and-forget: the answer arrives later through
    /// `AuthenticationCoordinator::submit_answer` carrying `correlation_id`.
    async fn issue_challenge(
        &self,
        subject: &Subject,
        correlation_id: &str,
        context: &InteractionRef,
    ) -> Result<()>;

    /// Tell the platform the interaction is being worked on (deferred reply).
    async fn acknowledge(&self, context: &InteractionRef) -> Result<()> {
        let _ = context;
        Ok(())
    }
}

/// Per-subject leaky-bucket state.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdmissionState {
    /// Unix epoch milliseconds of the last admitted command.
    pub last_update_ms: i64,
    /// Current fill level in command units, `0 <= level <= capacity`.
    pub level: f64,
}

/// A stored admission state together with the version it was read at.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// Shared atomic counter store backing the admission gate.
///
/// Implementations may be out-of-process; the only atomicity requirement is
/// per key compare-and-set.
#[async_trait]
pub trait AdmissionStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Versioned<AdmissionState>>>;

    /// Store `state` iff the key is still at `expected` (`None`: key absent).
    ///
    /// Returns `Ok(false)` when another writer got there first. `ttl` lets the
    /// store expire buckets that have fully drained.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        state: AdmissionState,
        ttl: Duration,
    ) -> Result<bool>;
}

/// Business logic for one command name (character card, abyss summary...).
///
/// Errors are opaque to the dispatcher. Returning a
/// [`CommandFailure`](crate::errors::CommandFailure) (through `anyhow`) passes a
/// user-facing failure through unchanged; anything else is logged and reported
/// as a generic execution failure.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn execute(&self, ctx: ExecutionContext) -> anyhow::Result<CommandOutput>;
}
