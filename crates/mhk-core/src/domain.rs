use std::fmt;

use serde::{Deserialize, Serialize};

/// Chat-platform user id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Chat/channel id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(pub i64);

/// A user together with the enrolled game profile a command targets.
///
/// Admission is keyed by `user_id` only; credentials are scoped per profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    pub user_id: UserId,
    pub profile_id: u32,
}

impl Subject {
    pub fn new(user_id: UserId, profile_id: u32) -> Self {
        Self {
            user_id,
            profile_id,
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.user_id, self.profile_id)
    }
}

/// A stable reference to the interaction a reply should go to.
///
/// The bot answers on the interaction that carried the *latest* user input:
/// the command's own interaction on the fast path, the challenge answer on the slow path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InteractionRef {
    pub chat_id: ChatId,
    pub interaction_id: String,
}

impl InteractionRef {
    pub fn new(chat_id: ChatId, interaction_id: impl Into<String>) -> Self {
        Self {
            chat_id,
            interaction_id: interaction_id.into(),
        }
    }
}

/// Encrypted credential material as persisted by the profile store.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecret(pub String);

impl fmt::Debug for EncryptedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptedSecret(..)")
    }
}

/// User-supplied material (passphrase) able to decrypt an [`EncryptedSecret`].
#[derive(Clone, PartialEq, Eq)]
pub struct SecretMaterial(String);

impl SecretMaterial {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretMaterial(***)")
    }
}

/// A decrypted, usable API token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token(pub String);

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(***)")
    }
}

/// What the credential store holds for one enrolled profile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredCredential {
    /// Third-party game account id the token belongs to.
    pub account_id: u64,
    pub secret: EncryptedSecret,
}
