//! Audit events.
//!
//! Events are immutable. They are appended by the store inside the same
//! transaction as the state change they document.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{ClientMetaData, MytokenId};

/// The fixed vocabulary of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "created")]
    Created,
    #[serde(rename = "AT_created")]
    AccessTokenCreated,
    #[serde(rename = "subtoken_created")]
    SubtokenCreated,
    #[serde(rename = "revoked")]
    Revoked,
    #[serde(rename = "tokeninfo_introspect")]
    TokeninfoIntrospect,
    #[serde(rename = "tokeninfo_history")]
    TokeninfoHistory,
    #[serde(rename = "tokeninfo_list")]
    TokeninfoList,
    #[serde(rename = "transfer_code_created")]
    TransferCodeCreated,
    #[serde(rename = "transfer_code_used")]
    TransferCodeUsed,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::Created,
        EventKind::AccessTokenCreated,
        EventKind::SubtokenCreated,
        EventKind::Revoked,
        EventKind::TokeninfoIntrospect,
        EventKind::TokeninfoHistory,
        EventKind::TokeninfoList,
        EventKind::TransferCodeCreated,
        EventKind::TransferCodeUsed,
    ];

    /// The persisted name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::AccessTokenCreated => "AT_created",
            EventKind::SubtokenCreated => "subtoken_created",
            EventKind::Revoked => "revoked",
            EventKind::TokeninfoIntrospect => "tokeninfo_introspect",
            EventKind::TokeninfoHistory => "tokeninfo_history",
            EventKind::TokeninfoList => "tokeninfo_list",
            EventKind::TransferCodeCreated => "transfer_code_created",
            EventKind::TransferCodeUsed => "transfer_code_used",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "event")]
    pub kind: EventKind,
    #[serde(rename = "mom_id")]
    pub mytoken_id: MytokenId,
    pub time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl Event {
    /// An event caused by a request from `client`.
    pub fn new(kind: EventKind, mytoken_id: MytokenId, client: &ClientMetaData, time: i64) -> Self {
        Self {
            kind,
            mytoken_id,
            time,
            comment: None,
            ip: client.ip.to_string(),
            user_agent: client.user_agent.clone(),
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_roundtrip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_name(kind.as_str()), Some(kind));
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
        assert_eq!(EventKind::from_name("exploded"), None);
    }

    #[test]
    fn test_event_from_client() {
        let client = ClientMetaData::new("127.0.0.1".parse().unwrap()).with_user_agent("curl/8");
        let id = MytokenId::generate();
        let event = Event::new(EventKind::Revoked, id, &client, 42).with_comment("recursive");

        assert_eq!(event.ip, "127.0.0.1");
        assert_eq!(event.user_agent.as_deref(), Some("curl/8"));
        assert_eq!(event.comment.as_deref(), Some("recursive"));
        assert_eq!(event.mytoken_id, id);
    }
}
