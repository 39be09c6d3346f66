//! The pending-exchange state machine.
//!
//! A pending exchange lets a mytoken be claimed asynchronously with a
//! polling code:
//!
//! ```text
//! Pending ──consent──▶ Granted ──poll──▶ Claimed
//!    │
//!    └────decline────▶ Declined
//! ```
//!
//! `Expired` is derived from time and wins over every other state. This
//! module only classifies persisted rows; the transitions themselves are
//! conditional updates in the store.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capability::{Capability, CapabilitySet};
use crate::codec::ResponseType;
use crate::restriction::Restriction;

/// The consent decision recorded for an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentState {
    Pending,
    Granted,
    Declined,
}

impl ConsentState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConsentState::Pending => "pending",
            ConsentState::Granted => "granted",
            ConsentState::Declined => "declined",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "pending" => Some(ConsentState::Pending),
            "granted" => Some(ConsentState::Granted),
            "declined" => Some(ConsentState::Declined),
            _ => None,
        }
    }
}

/// What the user answered on the consent screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentDecision {
    Grant,
    Decline,
}

impl ConsentDecision {
    pub fn resulting_state(self) -> ConsentState {
        match self {
            ConsentDecision::Grant => ConsentState::Granted,
            ConsentDecision::Decline => ConsentState::Declined,
        }
    }
}

/// The state of an exchange as seen by a poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Waiting for consent or for the flow to finish.
    Pending,
    /// A token is attached and can be claimed.
    Granted,
    Declined,
    Claimed,
    Expired,
}

impl ExchangeState {
    /// The error a poll in this state answers with, or `None` when the token
    /// can be claimed.
    pub fn poll_error(self) -> Option<ExchangeError> {
        match self {
            ExchangeState::Pending => Some(ExchangeError::AuthorizationPending),
            ExchangeState::Granted => None,
            ExchangeState::Declined => Some(ExchangeError::ConsentDeclined),
            ExchangeState::Claimed => Some(ExchangeError::AlreadyClaimed),
            ExchangeState::Expired => Some(ExchangeError::Expired),
        }
    }

    /// No transition leaves a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExchangeState::Declined | ExchangeState::Claimed | ExchangeState::Expired
        )
    }
}

/// The persisted facts an exchange state is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeStatus {
    pub consent: ConsentState,
    pub expires_at: i64,
    pub token_attached: bool,
    pub claimed: bool,
}

impl ExchangeStatus {
    /// Classify at `now`. The code is usable up to and including
    /// `expires_at`.
    pub fn state_at(&self, now: i64) -> ExchangeState {
        if now > self.expires_at {
            ExchangeState::Expired
        } else if self.consent == ConsentState::Declined {
            ExchangeState::Declined
        } else if self.claimed {
            ExchangeState::Claimed
        } else if self.consent == ConsentState::Granted && self.token_attached {
            ExchangeState::Granted
        } else {
            ExchangeState::Pending
        }
    }
}

/// Errors of the exchange state machine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("unknown code")]
    UnknownCode,

    #[error("authorization pending")]
    AuthorizationPending,

    #[error("consent declined")]
    ConsentDeclined,

    #[error("code expired")]
    Expired,

    #[error("code already claimed")]
    AlreadyClaimed,

    #[error("consent already decided")]
    ConsentAlreadyDecided,

    #[error("consent has not been granted")]
    ConsentRequired,
}

/// Parameters of a mytoken request, stored with the exchange until the flow
/// completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowParameters {
    pub oidc_issuer: String,

    #[serde(default)]
    pub restrictions: Vec<Restriction>,

    #[serde(default = "default_capabilities")]
    pub capabilities: CapabilitySet,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtoken_capabilities: Option<CapabilitySet>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub response_type: ResponseType,
}

impl FlowParameters {
    pub fn new(oidc_issuer: impl Into<String>) -> Self {
        Self {
            oidc_issuer: oidc_issuer.into(),
            restrictions: Vec::new(),
            capabilities: default_capabilities(),
            subtoken_capabilities: None,
            name: None,
            response_type: ResponseType::default(),
        }
    }
}

fn default_capabilities() -> CapabilitySet {
    CapabilitySet::from([Capability::AccessToken])
}

/// A random alphanumeric code of `len` characters.
pub fn generate_code(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(consent: ConsentState, token_attached: bool, claimed: bool) -> ExchangeStatus {
        ExchangeStatus {
            consent,
            expires_at: 100,
            token_attached,
            claimed,
        }
    }

    #[test]
    fn test_state_classification() {
        assert_eq!(status(ConsentState::Pending, false, false).state_at(50), ExchangeState::Pending);
        // consent given but flow not finished yet
        assert_eq!(status(ConsentState::Granted, false, false).state_at(50), ExchangeState::Pending);
        assert_eq!(status(ConsentState::Granted, true, false).state_at(50), ExchangeState::Granted);
        assert_eq!(status(ConsentState::Granted, false, true).state_at(50), ExchangeState::Claimed);
        assert_eq!(status(ConsentState::Declined, false, false).state_at(50), ExchangeState::Declined);
    }

    #[test]
    fn test_expiry_wins() {
        for s in [
            status(ConsentState::Pending, false, false),
            status(ConsentState::Granted, true, false),
            status(ConsentState::Declined, false, false),
            status(ConsentState::Granted, false, true),
        ] {
            assert_ne!(s.state_at(100), ExchangeState::Expired);
            assert_eq!(s.state_at(101), ExchangeState::Expired);
        }
    }

    #[test]
    fn test_poll_errors() {
        assert_eq!(ExchangeState::Granted.poll_error(), None);
        assert_eq!(
            ExchangeState::Pending.poll_error(),
            Some(ExchangeError::AuthorizationPending)
        );
        assert_eq!(
            ExchangeState::Declined.poll_error(),
            Some(ExchangeError::ConsentDeclined)
        );
        assert!(ExchangeState::Declined.is_terminal());
        assert!(!ExchangeState::Granted.is_terminal());
    }

    #[test]
    fn test_code_errors_are_neutral() {
        // transfer codes and polling codes share these errors
        for err in [
            ExchangeError::UnknownCode,
            ExchangeError::Expired,
            ExchangeError::AlreadyClaimed,
        ] {
            assert!(!err.to_string().contains("polling"), "{}", err);
        }
        assert_eq!(ExchangeError::UnknownCode.to_string(), "unknown code");
    }

    #[test]
    fn test_flow_parameter_defaults() {
        let flow: FlowParameters =
            serde_json::from_str(r#"{"oidc_issuer":"https://idp.example"}"#).unwrap();
        assert_eq!(flow, FlowParameters::new("https://idp.example"));
        assert!(flow.capabilities.has(Capability::AccessToken));
        assert_eq!(flow.response_type, ResponseType::Token);
    }

    #[test]
    fn test_generate_code() {
        let a = generate_code(32);
        let b = generate_code(32);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_consent_names() {
        for c in [ConsentState::Pending, ConsentState::Granted, ConsentState::Declined] {
            assert_eq!(ConsentState::from_name(c.as_str()), Some(c));
        }
        assert_eq!(ConsentDecision::Decline.resulting_state(), ConsentState::Declined);
    }
}
