//! Store trait: the abstract interface for mytoken persistence.
//!
//! Every method that changes state runs in a single transaction together with
//! its usage increment and its ledger entries. Either all of it commits or
//! none of it does.

use async_trait::async_trait;
use serde::Serialize;

use mytoken_core::{
    CapabilitySet, ClientMetaData, ConsentDecision, ConsentState, Decision, Event, ExchangeStatus,
    FlowParameters, MytokenId, Restriction, UsageKind, UsedRestriction,
};

use crate::error::Result;

/// A use of a restriction clause to be recorded with an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageClaim {
    pub mytoken_id: MytokenId,
    /// Index of the clause in the mytoken's restriction list.
    pub clause: usize,
    pub kind: UsageKind,
}

impl UsageClaim {
    /// The claim an authorization decision calls for. Unrestricted mytokens
    /// have nothing to count.
    pub fn for_decision(mytoken_id: MytokenId, decision: Decision, kind: UsageKind) -> Option<Self> {
        match decision {
            Decision::Allowed { clause: Some(clause) } => Some(Self {
                mytoken_id,
                clause,
                kind,
            }),
            Decision::Allowed { clause: None } | Decision::Denied => None,
        }
    }
}

/// A short token and the long-form token it stands for.
#[derive(Clone, PartialEq, Eq)]
pub struct ShortToken {
    pub short: String,
    pub long: String,
}

impl std::fmt::Debug for ShortToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ShortToken(..)")
    }
}

/// A mytoken about to be persisted.
#[derive(Debug, Clone)]
pub struct NewMytoken {
    pub id: MytokenId,
    pub parent_id: Option<MytokenId>,
    pub oidc_iss: String,
    pub oidc_sub: String,
    pub name: Option<String>,
    pub capabilities: CapabilitySet,
    pub subtoken_capabilities: Option<CapabilitySet>,
    pub restrictions: Vec<Restriction>,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    /// Address the mytoken was requested from.
    pub ip: String,
    /// Refresh token for a root. Children share their parent's.
    pub refresh_token: Option<String>,
    pub short_token: Option<ShortToken>,
    /// A transfer code to create alongside the mytoken.
    pub transfer: Option<NewExchange>,
}

/// A persisted mytoken with its usage counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMytoken {
    pub id: MytokenId,
    pub parent_id: Option<MytokenId>,
    pub oidc_iss: String,
    pub oidc_sub: String,
    pub name: Option<String>,
    pub capabilities: CapabilitySet,
    pub subtoken_capabilities: Option<CapabilitySet>,
    /// Clauses in list order.
    pub restrictions: Vec<UsedRestriction>,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub ip: String,
    pub revoked: bool,
}

/// A row of the mytoken listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MytokenEntry {
    #[serde(rename = "mom_id")]
    pub id: MytokenId,
    #[serde(skip)]
    pub parent_id: Option<MytokenId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub capabilities: CapabilitySet,
    #[serde(rename = "created")]
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    pub ip: String,
}

/// A mytoken with its live descendants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MytokenTree {
    #[serde(flatten)]
    pub token: MytokenEntry,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<MytokenTree>,
}

impl MytokenTree {
    /// Arrange a flat listing into trees. Entries whose parent is not part of
    /// the listing (revoked, or never existed) become roots.
    pub fn build(entries: Vec<MytokenEntry>) -> Vec<MytokenTree> {
        let ids: std::collections::HashSet<MytokenId> = entries.iter().map(|e| e.id).collect();
        let (roots, children): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .partition(|e| e.parent_id.map_or(true, |p| !ids.contains(&p)));

        roots
            .into_iter()
            .map(|root| Self::attach(root, &children))
            .collect()
    }

    fn attach(token: MytokenEntry, pool: &[MytokenEntry]) -> MytokenTree {
        let children = pool
            .iter()
            .filter(|e| e.parent_id == Some(token.id))
            .cloned()
            .map(|child| Self::attach(child, pool))
            .collect();
        MytokenTree { token, children }
    }
}

/// An issued access token. Only its fingerprint is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessTokenRecord {
    pub mytoken_id: MytokenId,
    pub fingerprint: String,
    pub ip: String,
    pub comment: Option<String>,
    pub scopes: Vec<String>,
    pub audiences: Vec<String>,
    pub created_at: i64,
    pub expires_at: Option<i64>,
}

/// A pending exchange about to be persisted.
#[derive(Debug, Clone)]
pub struct NewExchange {
    pub code: String,
    pub consent_code: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
    pub consent: ConsentState,
    pub flow: Option<FlowParameters>,
    pub mytoken_id: Option<MytokenId>,
    pub token: Option<String>,
}

impl NewExchange {
    /// A polling code waiting for consent.
    pub fn polling(
        code: String,
        consent_code: String,
        flow: FlowParameters,
        now: i64,
        expires_at: i64,
    ) -> Self {
        Self {
            code,
            consent_code: Some(consent_code),
            created_at: now,
            expires_at,
            consent: ConsentState::Pending,
            flow: Some(flow),
            mytoken_id: None,
            token: None,
        }
    }

    /// A transfer code: consent is implied, the token is attached right away.
    pub fn transfer(code: String, mytoken_id: MytokenId, token: String, now: i64, expires_at: i64) -> Self {
        Self {
            code,
            consent_code: None,
            created_at: now,
            expires_at,
            consent: ConsentState::Granted,
            flow: None,
            mytoken_id: Some(mytoken_id),
            token: Some(token),
        }
    }
}

/// A persisted pending exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredExchange {
    pub code: String,
    pub consent_code: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
    pub consent: ConsentState,
    pub flow: Option<FlowParameters>,
    pub mytoken_id: Option<MytokenId>,
    pub token_attached: bool,
    pub claimed: bool,
}

impl StoredExchange {
    pub fn status(&self) -> ExchangeStatus {
        ExchangeStatus {
            consent: self.consent,
            expires_at: self.expires_at,
            token_attached: self.token_attached,
            claimed: self.claimed,
        }
    }
}

/// The Store trait: async interface for mytoken persistence.
///
/// All methods are async to support both sync (SQLite) and async backends.
/// For SQLite, we use `spawn_blocking` internally to avoid blocking the runtime.
///
/// # Design Notes
///
/// - **Conditional usage**: a `UsageClaim` is recorded with
///   `UPDATE ... WHERE done < ceiling`. If that matches nothing the whole
///   transaction is rolled back with [`StoreError::UsageExhausted`].
/// - **Exactly-once claims**: popping an exchange token is a single
///   conditional update.
///
/// [`StoreError::UsageExhausted`]: crate::StoreError::UsageExhausted
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Mytoken Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Persist a mytoken with its restrictions, record `usage` against the
    /// parent, and append `events`.
    async fn insert_mytoken(
        &self,
        mytoken: NewMytoken,
        usage: Option<UsageClaim>,
        events: Vec<Event>,
    ) -> Result<()>;

    /// Get a mytoken by id, revoked or not.
    async fn get_mytoken(&self, id: &MytokenId) -> Result<Option<StoredMytoken>>;

    /// The refresh token a mytoken uses at its provider.
    async fn get_refresh_token(&self, id: &MytokenId) -> Result<Option<String>>;

    /// Resolve a short token to its long form.
    async fn resolve_short_token(&self, short: &str) -> Result<Option<String>>;

    /// All live mytokens of one user.
    async fn list_mytokens(&self, oidc_iss: &str, oidc_sub: &str) -> Result<Vec<MytokenEntry>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Hierarchy Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Ids of the descendants of a mytoken, excluding itself.
    async fn descendants(&self, id: &MytokenId) -> Result<Vec<MytokenId>>;

    /// Revoke `target`, and its whole subtree if `recursive`.
    ///
    /// Returns the ids that were newly revoked; already revoked mytokens are
    /// skipped. One `revoked` event is appended per newly revoked mytoken.
    async fn revoke(
        &self,
        target: &MytokenId,
        recursive: bool,
        usage: Option<UsageClaim>,
        client: &ClientMetaData,
        now: i64,
    ) -> Result<Vec<MytokenId>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Usage & Ledger Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Record a use and its events, for operations that change nothing else.
    async fn record_usage(&self, usage: Option<UsageClaim>, events: Vec<Event>) -> Result<()>;

    /// Record an issued access token with its use and event, and store the
    /// provider's rotated refresh token if it sent one.
    async fn record_access_token(
        &self,
        usage: Option<UsageClaim>,
        record: AccessTokenRecord,
        rotated_refresh_token: Option<String>,
        event: Event,
    ) -> Result<()>;

    /// Access tokens issued through a mytoken, oldest first.
    async fn access_tokens(&self, id: &MytokenId) -> Result<Vec<AccessTokenRecord>>;

    /// Events of a mytoken and its descendants, oldest first.
    async fn history(&self, id: &MytokenId) -> Result<Vec<Event>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Pending Exchange Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Persist a new exchange with an optional use and events.
    async fn insert_exchange(
        &self,
        exchange: NewExchange,
        usage: Option<UsageClaim>,
        events: Vec<Event>,
    ) -> Result<()>;

    /// Get an exchange by polling or transfer code.
    async fn get_exchange(&self, code: &str) -> Result<Option<StoredExchange>>;

    /// Get an exchange by consent code.
    async fn get_exchange_by_consent_code(&self, consent_code: &str)
        -> Result<Option<StoredExchange>>;

    /// Record the consent decision. Only an unexpired exchange with pending
    /// consent can be decided.
    async fn decide_consent(
        &self,
        consent_code: &str,
        decision: ConsentDecision,
        now: i64,
    ) -> Result<()>;

    /// Persist the mytoken minted by a finished flow and attach `token` to
    /// the granted exchange.
    async fn complete_exchange(
        &self,
        consent_code: &str,
        mytoken: NewMytoken,
        token: String,
        events: Vec<Event>,
        now: i64,
    ) -> Result<()>;

    /// Take the attached token. Succeeds for exactly one caller.
    async fn pop_exchange_token(
        &self,
        code: &str,
        client: &ClientMetaData,
        now: i64,
    ) -> Result<String>;
}

/// Extension trait for common store patterns.
pub trait StoreExt: Store {
    /// The live mytokens of one user, arranged by parent.
    fn mytoken_trees(
        &self,
        oidc_iss: &str,
        oidc_sub: &str,
    ) -> impl std::future::Future<Output = Result<Vec<MytokenTree>>> + Send;
}

impl<S: Store + ?Sized> StoreExt for S {
    async fn mytoken_trees(&self, oidc_iss: &str, oidc_sub: &str) -> Result<Vec<MytokenTree>> {
        let entries = self.list_mytokens(oidc_iss, oidc_sub).await?;
        Ok(MytokenTree::build(entries))
    }
}
