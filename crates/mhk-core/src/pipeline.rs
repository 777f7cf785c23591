//! Admit → authenticate → dispatch, the path every interactive command takes.

use std::{collections::BTreeMap, sync::Arc};

use tokio_util::sync::CancellationToken;

use crate::{
    admission::AdmissionGate,
    auth::{AuthError, AuthenticationCoordinator},
    dispatch::{CommandDispatcher, CommandRequest, CommandResult, Job},
    domain::{InteractionRef, Subject},
    errors::CommandFailure,
};

/// One command as it arrives from the chat platform.
#[derive(Clone, Debug)]
pub struct CommandInvocation {
    pub command: String,
    pub subject: Subject,
    pub context: InteractionRef,
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub cancel: CancellationToken,
}

impl CommandInvocation {
    pub fn new(command: impl Into<String>, subject: Subject, context: InteractionRef) -> Self {
        Self {
            command: command.into(),
            subject,
            context,
            parameters: BTreeMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// The outcome plus the interaction to answer on.
///
/// After a passphrase challenge the triggering interaction has usually been
/// consumed, so `reply_to` is the one the answer arrived on.
#[derive(Debug)]
pub struct PipelineReply {
    pub reply_to: InteractionRef,
    pub result: CommandResult,
}

pub struct CommandPipeline {
    gate: Arc<AdmissionGate>,
    auth: Arc<AuthenticationCoordinator>,
    dispatcher: CommandDispatcher,
}

impl CommandPipeline {
    pub fn new(
        gate: Arc<AdmissionGate>,
        auth: Arc<AuthenticationCoordinator>,
        dispatcher: CommandDispatcher,
    ) -> Self {
        Self {
            gate,
            auth,
            dispatcher,
        }
    }

    /// Coordinator handle for the interactive layer to deliver answers.
    pub fn auth(&self) -> &Arc<AuthenticationCoordinator> {
        &self.auth
    }

    pub async fn run(&self, invocation: CommandInvocation) -> PipelineReply {
        let CommandInvocation {
            command,
            subject,
            context,
            parameters,
            cancel,
        } = invocation;

        if !self.gate.try_admit(subject.user_id).await {
            tracing::info!(%subject, command = %command, "Command rate limited");
            return PipelineReply {
                reply_to: context,
                result: Err(CommandFailure::admission_denied()),
            };
        }

        let authenticated = match self.auth.resolve_credential(subject, context.clone()).await {
            Ok(authenticated) => authenticated,
            Err(err) => {
                let reply_to = match &err {
                    AuthError::InvalidSecret { context, .. } => context.clone(),
                    _ => context,
                };
                match &err {
                    AuthError::Unavailable(e) => {
                        tracing::error!(%subject, command = %command, error = %e, "Authentication failed")
                    }
                    other => {
                        tracing::info!(%subject, command = %command, reason = ?other.reason(), "Authentication rejected")
                    }
                }
                return PipelineReply {
                    reply_to,
                    result: Err(err.into()),
                };
            }
        };

        let reply_to = authenticated.context.clone();
        let mut request =
            CommandRequest::new(command, authenticated.credential, authenticated.context);
        request.parameters = parameters;

        let result = self
            .dispatcher
            .submit(Job::new(request).with_cancellation(cancel))
            .await;
        PipelineReply { reply_to, result }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        admission::{AdmissionConfig, FailureMode},
        auth::{AuthConfig, ChallengeAnswer},
        dispatch::{CommandOutput, CommandRegistry, DispatcherConfig, ExecutionContext},
        domain::{ChatId, EncryptedSecret, SecretMaterial, StoredCredential, Token, UserId},
        errors::FailureReason,
        memory::{MemoryAdmissionStore, MemoryCache, MemoryCredentialStore},
        metrics::NoopMetrics,
        ports::{Cipher, ExecutionEngine, InteractiveChannel, InvalidSecret},
    };

    struct ReverseCipher;

    impl Cipher for ReverseCipher {
        fn decrypt(
            &self,
            secret: &EncryptedSecret,
            material: &SecretMaterial,
        ) -> std::result::Result<Token, InvalidSecret> {
            if material.expose() == "hunter2" {
                Ok(Token(secret.0.chars().rev().collect()))
            } else {
                Err(InvalidSecret)
            }
        }
    }

    struct ForwardingChannel {
        issued: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl InteractiveChannel for ForwardingChannel {
        async fn issue_challenge(
            &self,
            _subject: &Subject,
            correlation_id: &str,
            _context: &InteractionRef,
        ) -> crate::Result<()> {
            let _ = self.issued.send(correlation_id.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct TokenEcho {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ExecutionEngine for TokenEcho {
        async fn execute(&self, ctx: ExecutionContext) -> anyhow::Result<CommandOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let uid = ctx.parameter_str("uid").unwrap_or("?");
            Ok(CommandOutput::text(format!(
                "{} {uid}",
                ctx.request.credential.token.0
            )))
        }
    }

    struct Harness {
        pipeline: CommandPipeline,
        engine: Arc<TokenEcho>,
        issued: mpsc::UnboundedReceiver<String>,
        subject: Subject,
    }

    fn harness(capacity: u32) -> Harness {
        let subject = Subject::new(UserId(1001), 1);
        let credentials = Arc::new(MemoryCredentialStore::new());
        credentials.enroll(
            subject,
            StoredCredential {
                account_id: 700_001,
                secret: EncryptedSecret("nekot".into()),
            },
        );

        let (tx, issued) = mpsc::unbounded_channel();
        let auth = Arc::new(AuthenticationCoordinator::new(
            credentials,
            Arc::new(MemoryCache::new()),
            Arc::new(ReverseCipher),
            Arc::new(ForwardingChannel { issued: tx }),
            AuthConfig {
                timeout: Duration::from_secs(5),
                token_ttl: Duration::from_secs(600),
            },
            "test:",
        ));
        let gate = Arc::new(AdmissionGate::new(
            Arc::new(MemoryAdmissionStore::new()),
            AdmissionConfig {
                capacity,
                leak_interval: Duration::from_secs(60),
                failure_mode: FailureMode::FailClosed,
            },
            "test:",
        ));

        let engine = Arc::new(TokenEcho::default());
        let registry = CommandRegistry::new().with("profile", engine.clone());
        let (dispatcher, _task) = CommandDispatcher::start(
            DispatcherConfig::default(),
            registry,
            Arc::new(NoopMetrics),
        )
        .expect("start");

        Harness {
            pipeline: CommandPipeline::new(gate, auth, dispatcher),
            engine,
            issued,
            subject,
        }
    }

    fn answer(subject: Subject, correlation_id: String, secret: &str) -> ChallengeAnswer {
        ChallengeAnswer {
            correlation_id,
            subject,
            secret: SecretMaterial::new(secret),
            context: InteractionRef::new(ChatId(5), "modal-submit"),
        }
    }

    #[tokio::test]
    async fn challenge_then_cached_run() {
        let mut h = harness(5);
        let pipeline = Arc::new(h.pipeline);
        let invocation = CommandInvocation::new(
            "profile",
            h.subject,
            InteractionRef::new(ChatId(5), "slash-1"),
        )
        .with_parameter("uid", serde_json::json!("800123"));

        let run = tokio::spawn({
            let pipeline = pipeline.clone();
            let invocation = invocation.clone();
            async move { pipeline.run(invocation).await }
        });

        let id = h.issued.recv().await.expect("challenge issued");
        assert!(pipeline.auth().submit_answer(answer(h.subject, id, "hunter2")));

        let reply = run.await.unwrap();
        assert_eq!(reply.reply_to.interaction_id, "modal-submit");
        assert_eq!(reply.result.unwrap().content, "token 800123");

        // Token now cached: no second challenge.
        let again = pipeline.run(invocation).await;
        assert_eq!(again.reply_to.interaction_id, "slash-1");
        assert_eq!(again.result.unwrap().content, "token 800123");
        assert!(h.issued.try_recv().is_err());
        assert_eq!(h.engine.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn denied_command_never_reaches_auth_or_engine() {
        let mut h = harness(0);

        let reply = h
            .pipeline
            .run(CommandInvocation::new(
                "profile",
                h.subject,
                InteractionRef::new(ChatId(5), "slash-1"),
            ))
            .await;

        assert_eq!(reply.result.unwrap_err().reason, FailureReason::AdmissionDenied);
        assert!(h.issued.try_recv().is_err());
        assert_eq!(h.engine.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unenrolled_profile_never_creates_a_job() {
        let h = harness(5);

        let stranger = Subject::new(UserId(9), 1);
        let reply = h
            .pipeline
            .run(CommandInvocation::new(
                "profile",
                stranger,
                InteractionRef::new(ChatId(5), "slash-1"),
            ))
            .await;

        assert_eq!(
            reply.result.unwrap_err().reason,
            FailureReason::CredentialNotFound
        );
        assert_eq!(h.engine.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn wrong_passphrase_replies_on_the_answer_interaction() {
        let mut h = harness(5);
        let pipeline = Arc::new(h.pipeline);

        let run = tokio::spawn({
            let pipeline = pipeline.clone();
            let invocation = CommandInvocation::new(
                "profile",
                h.subject,
                InteractionRef::new(ChatId(5), "slash-1"),
            );
            async move { pipeline.run(invocation).await }
        });

        let id = h.issued.recv().await.expect("challenge issued");
        assert!(pipeline.auth().submit_answer(answer(h.subject, id, "letmein")));

        let reply = run.await.unwrap();
        assert_eq!(reply.reply_to.interaction_id, "modal-submit");
        assert_eq!(
            reply.result.unwrap_err().reason,
            FailureReason::CredentialInvalid
        );
        assert_eq!(h.engine.calls.load(Ordering::SeqCst), 0);
    }
}
