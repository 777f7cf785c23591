//! Passphrase handshake that turns an enrolled profile into a usable token.
//!
//! Fast path: the decrypted token is still in the shared cache.
//! Slow path: register a pending challenge under a fresh correlation id, ask the
//! user through the [`InteractiveChannel`], and wait (bounded by a deadline) for
//! [`AuthenticationCoordinator::submit_answer`] to hand over the passphrase.
//!
//! A pending challenge is consumed at most once. Whoever removes the entry from
//! the correlation map owns it: `submit_answer` removes and signals under the
//! same lock, and the waiter only reports a timeout if it removed the entry
//! itself.

use std::{
    collections::{hash_map::Entry, HashMap},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::{
    domain::{InteractionRef, SecretMaterial, StoredCredential, Subject, Token, UserId},
    errors::{CommandFailure, Error, FailureReason},
    ports::{Cipher, CredentialStore, InteractiveChannel, InvalidSecret, SharedCache},
};

#[derive(Clone, Copy, Debug)]
pub struct AuthConfig {
    /// How long a user has to answer a passphrase challenge.
    pub timeout: Duration,
    /// How long a decrypted token stays in the shared cache.
    pub token_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            token_ttl: Duration::from_secs(600),
        }
    }
}

/// A user's response to a challenge, as delivered by the interactive layer.
#[derive(Clone, Debug)]
pub struct ChallengeAnswer {
    pub correlation_id: String,
    pub subject: Subject,
    pub secret: SecretMaterial,
    /// Interaction the answer arrived on (the modal submit, the reply message...).
    pub context: InteractionRef,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedCredential {
    pub subject: Subject,
    pub account_id: u64,
    pub token: Token,
    /// `None` when served from the cache (the remaining TTL is not tracked).
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug)]
pub struct Authenticated {
    pub credential: ResolvedCredential,
    /// Where the caller should reply.
    pub context: InteractionRef,
    /// Whether a passphrase challenge was needed.
    pub via_challenge: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no enrolled profile for {subject}")]
    NotFound { subject: Subject },

    #[error("challenge {correlation_id} unanswered after {timeout:?}")]
    Timeout {
        correlation_id: String,
        timeout: Duration,
    },

    #[error("incorrect passphrase for {subject}")]
    InvalidSecret {
        subject: Subject,
        context: InteractionRef,
    },

    #[error(transparent)]
    Unavailable(#[from] Error),
}

impl AuthError {
    pub fn reason(&self) -> FailureReason {
        match self {
            AuthError::NotFound { .. } => FailureReason::CredentialNotFound,
            AuthError::Timeout { .. } => FailureReason::CredentialTimeout,
            AuthError::InvalidSecret { .. } => FailureReason::CredentialInvalid,
            AuthError::Unavailable(_) => FailureReason::DownstreamExecutionFailure,
        }
    }
}

impl From<AuthError> for CommandFailure {
    fn from(e: AuthError) -> Self {
        let message = match &e {
            AuthError::NotFound { .. } => "No profile found. Please add a profile first.",
            AuthError::Timeout { .. } => "Authentication timed out. Please run the command again.",
            AuthError::InvalidSecret { .. } => "Incorrect passphrase. Please try again.",
            AuthError::Unavailable(_) => "An error occurred while authenticating. Please try again later.",
        };
        CommandFailure::new(e.reason(), message)
    }
}

struct PendingChallenge {
    subject: Subject,
    issued_at: DateTime<Utc>,
    waiter: oneshot::Sender<ChallengeAnswer>,
}

type PendingMap = Mutex<HashMap<String, PendingChallenge>>;

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<String, PendingChallenge>> {
    pending.lock().unwrap_or_else(|p| p.into_inner())
}

/// Removes the correlation entry when the waiting call ends, however it ends
/// (answered, timed out, channel error, caller dropped).
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    correlation_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.correlation_id);
    }
}

pub struct AuthenticationCoordinator {
    credentials: Arc<dyn CredentialStore>,
    cache: Arc<dyn SharedCache>,
    cipher: Arc<dyn Cipher>,
    channel: Arc<dyn InteractiveChannel>,
    cfg: AuthConfig,
    key_prefix: String,
    pending: PendingMap,
}

impl AuthenticationCoordinator {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        cache: Arc<dyn SharedCache>,
        cipher: Arc<dyn Cipher>,
        channel: Arc<dyn InteractiveChannel>,
        cfg: AuthConfig,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            credentials,
            cache,
            cipher,
            channel,
            cfg,
            key_prefix: key_prefix.into(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache_key(&self, user_id: UserId, account_id: u64) -> String {
        format!("{}bot_ltoken:{user_id}:{account_id}", self.key_prefix)
    }

    /// Number of challenges currently waiting for an answer.
    pub fn pending_challenges(&self) -> usize {
        lock(&self.pending).len()
    }

    pub async fn resolve_credential(
        &self,
        subject: Subject,
        context: InteractionRef,
    ) -> Result<Authenticated, AuthError> {
        tracing::debug!(%subject, "resolve_credential started");

        let Some(stored) = self.credentials.get(&subject).await? else {
            tracing::warn!(%subject, "Profile not found");
            return Err(AuthError::NotFound { subject });
        };

        let key = self.cache_key(subject.user_id, stored.account_id);
        if let Some(token) = self.cache.get(&key).await? {
            tracing::debug!(%subject, account_id = stored.account_id, "Cache hit for token");
            self.acknowledge(&context).await;
            return Ok(Authenticated {
                credential: ResolvedCredential {
                    subject,
                    account_id: stored.account_id,
                    token,
                    expires_at: None,
                },
                context,
                via_challenge: false,
            });
        }

        self.challenge(subject, stored, key, context).await
    }

    async fn challenge(
        &self,
        subject: Subject,
        stored: StoredCredential,
        key: String,
        context: InteractionRef,
    ) -> Result<Authenticated, AuthError> {
        let (correlation_id, rx) = self.register(subject);
        let _guard = PendingGuard {
            pending: &self.pending,
            correlation_id: correlation_id.clone(),
        };

        self.channel
            .issue_challenge(&subject, &correlation_id, &context)
            .await?;
        tracing::debug!(
            %subject,
            correlation_id = %correlation_id,
            timeout_secs = self.cfg.timeout.as_secs_f64(),
            "Challenge issued, waiting for answer"
        );

        let Some(answer) = self.await_answer(&correlation_id, rx).await else {
            tracing::info!(%subject, correlation_id = %correlation_id, "Authentication timed out");
            return Err(AuthError::Timeout {
                correlation_id,
                timeout: self.cfg.timeout,
            });
        };

        self.acknowledge(&answer.context).await;

        let token = match self.cipher.decrypt(&stored.secret, &answer.secret) {
            Ok(token) => token,
            Err(InvalidSecret) => {
                tracing::warn!(%subject, correlation_id = %correlation_id, "Incorrect passphrase provided");
                return Err(AuthError::InvalidSecret {
                    subject,
                    context: answer.context,
                });
            }
        };

        let ttl = self.cfg.token_ttl;
        if let Err(e) = self.cache.set(&key, token.clone(), ttl).await {
            // The token is valid; only the next command pays for the miss.
            tracing::warn!(%subject, error = %e, "Failed to cache token");
        }
        tracing::debug!(%subject, account_id = stored.account_id, "Authentication succeeded");

        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .map(|ttl| Utc::now() + ttl);
        Ok(Authenticated {
            credential: ResolvedCredential {
                subject,
                account_id: stored.account_id,
                token,
                expires_at,
            },
            context: answer.context,
            via_challenge: true,
        })
    }

    /// Deliver a user's answer to the waiting `resolve_credential` call.
    ///
    /// Returns `false` when the correlation id is unknown, already consumed or
    /// expired, or when the answer comes from a different subject than the one
    /// challenged (the challenge stays open in that case).
    pub fn submit_answer(&self, answer: ChallengeAnswer) -> bool {
        let mut map = lock(&self.pending);
        let entry = match map.entry(answer.correlation_id.clone()) {
            Entry::Vacant(_) => {
                tracing::warn!(
                    correlation_id = %answer.correlation_id,
                    "No authentication request found"
                );
                return false;
            }
            Entry::Occupied(entry) => entry,
        };

        if entry.get().subject != answer.subject {
            tracing::warn!(
                correlation_id = %answer.correlation_id,
                expected = %entry.get().subject,
                got = %answer.subject,
                "Answer subject does not match challenge"
            );
            return false;
        }

        let pending = entry.remove();
        tracing::debug!(
            correlation_id = %answer.correlation_id,
            subject = %answer.subject,
            waited_ms = (Utc::now() - pending.issued_at).num_milliseconds(),
            "Answer received"
        );
        pending.waiter.send(answer).is_ok()
    }

    fn register(&self, subject: Subject) -> (String, oneshot::Receiver<ChallengeAnswer>) {
        let (tx, rx) = oneshot::channel();
        let mut map = lock(&self.pending);
        loop {
            let id = Uuid::new_v4().to_string();
            if let Entry::Vacant(slot) = map.entry(id.clone()) {
                slot.insert(PendingChallenge {
                    subject,
                    issued_at: Utc::now(),
                    waiter: tx,
                });
                return (id, rx);
            }
        }
    }

    async fn await_answer(
        &self,
        correlation_id: &str,
        mut rx: oneshot::Receiver<ChallengeAnswer>,
    ) -> Option<ChallengeAnswer> {
        match tokio::time::timeout(self.cfg.timeout, &mut rx).await {
            Ok(answer) => answer.ok(),
            Err(_) => {
                if lock(&self.pending).remove(correlation_id).is_some() {
                    return None;
                }
                // `submit_answer` won the race; it sent while holding the lock.
                rx.try_recv().ok()
            }
        }
    }

    async fn acknowledge(&self, context: &InteractionRef) {
        if let Err(e) = self.channel.acknowledge(context).await {
            tracing::warn!(interaction = %context.interaction_id, error = %e, "Failed to acknowledge interaction");
        }
    }
}
