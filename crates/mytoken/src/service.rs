//! The mytoken service: unified API for issuing and using mytokens.
//!
//! The service brings together the signing keys, the store, and the
//! identity provider. Every state change it makes is a single store call, so
//! a failed request never leaves a partial trace.

use std::sync::Arc;

use mytoken_core::crypto::token_fingerprint;
use mytoken_core::exchange::generate_code;
use mytoken_core::restriction::{split_list, validate_all};
use mytoken_core::{
    authorize, codec, unix_now, Capability, CapabilitySet, ClientMetaData, ConsentDecision,
    ConsentState, Decision, Event, EventKind, ExchangeError, ExchangeState, FlowParameters, Jwks,
    KeyRing, Keypair, MytokenClaims, MytokenId, RequestContext, ResponseType, Restriction,
    TokenError, UsageKind, UsedRestriction, WireToken,
};
use mytoken_store::{
    AccessTokenRecord, MytokenTree, NewExchange, NewMytoken, ShortToken, Store, StoreError,
    StoreExt, StoredMytoken, UsageClaim,
};
use serde::Serialize;

use crate::config::ServiceConfig;
use crate::discovery::ConfigurationDocument;
use crate::error::{MytokenError, Result};
use crate::provider::IdentityProvider;

/// Source of the current unix time in seconds.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// A mytoken presented with a request, checked against its signature and the
/// database.
#[derive(Debug, Clone)]
pub struct Presented {
    pub claims: MytokenClaims,
    pub stored: StoredMytoken,
    /// The long form of the token.
    pub token: String,
}

/// A request for an OIDC access token.
#[derive(Debug, Clone, Default)]
pub struct AccessTokenRequest {
    pub mytoken: String,
    /// Must match the mytoken's issuer when given.
    pub oidc_issuer: Option<String>,
    pub scopes: Vec<String>,
    pub audiences: Vec<String>,
    pub comment: Option<String>,
}

/// An access token handed to the client.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct AccessTokenGrant {
    pub access_token: String,
    pub token_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    pub scope: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub audience: Vec<String>,
}

impl std::fmt::Debug for AccessTokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessTokenGrant")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .field("audience", &self.audience)
            .finish_non_exhaustive()
    }
}

/// A request for a child mytoken.
#[derive(Debug, Clone, Default)]
pub struct ChildRequest {
    /// The parent, as presented by the client.
    pub mytoken: String,
    /// Defaults to `AT` only.
    pub capabilities: Option<CapabilitySet>,
    pub subtoken_capabilities: Option<CapabilitySet>,
    pub restrictions: Vec<Restriction>,
    pub name: Option<String>,
    pub response_type: ResponseType,
}

/// How a newly minted mytoken reaches the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mytoken_type", rename_all = "snake_case")]
pub enum Delivery {
    Token { mytoken: String },
    ShortToken { mytoken: String },
    TransferCode { transfer_code: String, expires_in: i64 },
}

impl Delivery {
    fn response_type(&self) -> ResponseType {
        match self {
            Delivery::Token { .. } => ResponseType::Token,
            Delivery::ShortToken { .. } => ResponseType::ShortToken,
            Delivery::TransferCode { .. } => ResponseType::TransferCode,
        }
    }
}

/// A newly minted mytoken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuedMytoken {
    #[serde(skip)]
    pub id: MytokenId,
    #[serde(flatten)]
    pub delivery: Delivery,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    pub capabilities: CapabilitySet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtoken_capabilities: Option<CapabilitySet>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub restrictions: Vec<Restriction>,
}

/// A request to revoke a mytoken.
#[derive(Debug, Clone, Default)]
pub struct RevokeRequest {
    /// The mytoken authorizing the revocation.
    pub mytoken: String,
    /// Another mytoken of the same user; the presented one when absent.
    pub target: Option<MytokenId>,
    pub recursive: bool,
}

/// A started polling-code flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingExchange {
    pub polling_code: String,
    /// Handed to the consent screen, never to the polling client.
    #[serde(skip)]
    pub consent_code: String,
    pub consent_uri: String,
    pub expires_in: i64,
    pub interval: i64,
}

/// The outcome of the login at the identity provider.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderIdentity {
    /// The `sub` the provider reported.
    pub subject: String,
    pub refresh_token: String,
}

impl std::fmt::Debug for ProviderIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderIdentity")
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

/// A transfer code handed to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferCode {
    pub transfer_code: String,
    pub expires_in: i64,
}

/// What introspection reports about a mytoken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenInfo {
    #[serde(rename = "mom_id")]
    pub id: MytokenId,
    pub revoked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MytokenId>,
    pub oidc_iss: String,
    pub oidc_sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub capabilities: CapabilitySet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtoken_capabilities: Option<CapabilitySet>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub restrictions: Vec<UsedRestriction>,
    pub created: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl From<StoredMytoken> for TokenInfo {
    fn from(m: StoredMytoken) -> Self {
        Self {
            id: m.id,
            revoked: m.revoked,
            parent_id: m.parent_id,
            oidc_iss: m.oidc_iss,
            oidc_sub: m.oidc_sub,
            name: m.name,
            capabilities: m.capabilities,
            subtoken_capabilities: m.subtoken_capabilities,
            restrictions: m.restrictions,
            created: m.created_at,
            expires_at: m.expires_at,
        }
    }
}

/// The mytoken service.
///
/// Provides a unified API for:
/// - Authenticating presented mytokens
/// - Issuing access tokens and child mytokens
/// - Revocation
/// - Polling-code and transfer-code exchanges
/// - Token introspection and the event history
pub struct MytokenService<S: Store, P: IdentityProvider> {
    config: ServiceConfig,
    store: Arc<S>,
    provider: Arc<P>,
    keys: Arc<KeyRing>,
    clock: Clock,
}

impl<S: Store, P: IdentityProvider> MytokenService<S, P> {
    /// Create a new service instance.
    pub fn new(config: ServiceConfig, store: S, provider: P, keys: KeyRing) -> Self {
        Self {
            config,
            store: Arc::new(store),
            provider: Arc::new(provider),
            keys: Arc::new(keys),
            clock: Arc::new(unix_now),
        }
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Get the store reference.
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn keys(&self) -> &KeyRing {
        &self.keys
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Keys & Discovery
    // ─────────────────────────────────────────────────────────────────────────

    /// Switch to a new signing key. Tokens signed with the previous key no
    /// longer verify.
    pub fn rotate_signing_key(&self, next: Keypair) {
        let kid = next.public_key().kid();
        let previous = self.keys.rotate(next);
        tracing::info!(previous = %previous.public_key().kid(), kid = %kid, "rotated signing key");
    }

    /// The public signing keys.
    pub fn jwks(&self) -> Jwks {
        self.keys.jwks()
    }

    /// The server's self-description.
    pub fn discovery(&self) -> ConfigurationDocument {
        ConfigurationDocument::new(&self.config)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Authentication
    // ─────────────────────────────────────────────────────────────────────────

    /// Check a presented mytoken: short tokens are resolved, the signature
    /// and claims are verified, and the database row is loaded.
    ///
    /// Revoked mytokens authenticate; every operation but introspection
    /// rejects them afterwards.
    pub async fn authenticate(&self, presented: &str) -> Result<Presented> {
        let token = match WireToken::parse(presented)? {
            WireToken::Long(token) => token,
            WireToken::Short(short) => self
                .store
                .resolve_short_token(&short)
                .await?
                .ok_or(TokenError::UnknownShortToken)?,
        };

        let key = self.keys.current().public_key();
        let claims = codec::decode(&token, &key, self.now())?;
        if claims.iss.trim_end_matches('/') != self.config.issuer_url() {
            return Err(MytokenError::InvalidToken("issued by another server".into()));
        }

        let stored = self
            .store
            .get_mytoken(&claims.jti)
            .await?
            .ok_or_else(|| MytokenError::InvalidToken("unknown mytoken".into()))?;

        Ok(Presented {
            claims,
            stored,
            token,
        })
    }

    /// Check that a live mytoken may be used for `kind` and holds
    /// `capability`, and pick the clause to charge.
    fn authorize_use(
        &self,
        presented: &Presented,
        kind: UsageKind,
        ctx: &RequestContext,
        capability: Option<Capability>,
    ) -> Result<(Decision, Option<UsageClaim>)> {
        let mytoken = &presented.stored;
        if mytoken.revoked {
            tracing::debug!(mytoken_id = %mytoken.id, "revoked mytoken presented");
            return Err(MytokenError::InvalidToken("mytoken has been revoked".into()));
        }

        let decision = authorize(&mytoken.restrictions, kind, ctx);
        if !decision.is_allowed() {
            tracing::warn!(mytoken_id = %mytoken.id, ?kind, "no restriction clause admits request");
            return Err(MytokenError::UsageRestricted(
                "no restriction clause admits this request".into(),
            ));
        }

        if let Some(capability) = capability {
            if !mytoken.capabilities.has(capability) {
                tracing::warn!(mytoken_id = %mytoken.id, %capability, "capability missing");
                return Err(MytokenError::InsufficientCapability(format!(
                    "the {} capability is required",
                    capability
                )));
            }
        }

        Ok((decision, UsageClaim::for_decision(mytoken.id, decision, kind)))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Access Tokens
    // ─────────────────────────────────────────────────────────────────────────

    /// Obtain an OIDC access token through a mytoken.
    ///
    /// The provider is called before anything is written. Only a successful
    /// call consumes a use of the selected clause.
    pub async fn issue_access_token(
        &self,
        request: AccessTokenRequest,
        client: &ClientMetaData,
    ) -> Result<AccessTokenGrant> {
        let presented = self.authenticate(&request.mytoken).await?;
        let now = self.now();
        let ctx = RequestContext::new(client.ip, now)
            .with_scopes(request.scopes.clone())
            .with_audiences(request.audiences.clone());
        let (decision, usage) = self.authorize_use(
            &presented,
            UsageKind::AccessToken,
            &ctx,
            Some(Capability::AccessToken),
        )?;
        let mytoken = &presented.stored;

        if let Some(issuer) = &request.oidc_issuer {
            if issuer.trim_end_matches('/') != mytoken.oidc_iss.trim_end_matches('/') {
                return Err(MytokenError::MalformedRequest(
                    "the mytoken is not for this issuer".into(),
                ));
            }
        }
        let provider = self
            .config
            .provider(&mytoken.oidc_iss)
            .ok_or_else(|| MytokenError::UnknownIssuer(mytoken.oidc_iss.clone()))?;

        // Unspecified scopes and audiences come from the admitting clause.
        let clause = match decision {
            Decision::Allowed { clause: Some(i) } => {
                mytoken.restrictions.get(i).map(|r| &r.restriction)
            }
            _ => None,
        };
        let scopes = if !request.scopes.is_empty() {
            request.scopes
        } else if let Some(scope) = clause.and_then(|c| c.scope.as_deref()) {
            split_list(scope)
        } else {
            provider.scopes.clone()
        };
        let audiences = if !request.audiences.is_empty() {
            request.audiences
        } else {
            clause.map(|c| c.audiences.clone()).unwrap_or_default()
        };

        let refresh_token = self
            .store
            .get_refresh_token(&mytoken.id)
            .await?
            .ok_or_else(|| {
                MytokenError::from(StoreError::NotFound(format!(
                    "refresh token of {}",
                    mytoken.id
                )))
            })?;

        let tokens = self
            .provider
            .refresh(provider, &refresh_token, &scopes, &audiences)
            .await
            .map_err(|e| {
                tracing::warn!(mytoken_id = %mytoken.id, error = %e, "access token refused");
                e
            })?;

        let granted = tokens
            .scope
            .as_deref()
            .map(split_list)
            .unwrap_or_else(|| scopes.clone());
        let record = AccessTokenRecord {
            mytoken_id: mytoken.id,
            fingerprint: token_fingerprint(&tokens.access_token),
            ip: client.ip.to_string(),
            comment: request.comment.clone(),
            scopes: granted.clone(),
            audiences: audiences.clone(),
            created_at: now,
            expires_at: tokens.expires_in.map(|secs| now + secs),
        };
        let mut event = Event::new(EventKind::AccessTokenCreated, mytoken.id, client, now);
        if let Some(comment) = request.comment {
            event = event.with_comment(comment);
        }
        self.store
            .record_access_token(usage, record, tokens.refresh_token, event)
            .await?;

        tracing::info!(mytoken_id = %mytoken.id, scope = %granted.join(" "), "issued access token");
        Ok(AccessTokenGrant {
            access_token: tokens.access_token,
            token_type: tokens.token_type,
            expires_in: tokens.expires_in,
            scope: granted.join(" "),
            audience: audiences,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Child Mytokens
    // ─────────────────────────────────────────────────────────────────────────

    /// Mint a child of the presented mytoken.
    ///
    /// The child's capabilities and subtoken capabilities must lie within the
    /// parent's subtoken ceiling. Restrictions are taken as given.
    pub async fn create_child(
        &self,
        request: ChildRequest,
        client: &ClientMetaData,
    ) -> Result<IssuedMytoken> {
        let parent = self.authenticate(&request.mytoken).await?;
        let now = self.now();
        let ctx = RequestContext::new(client.ip, now);
        let (_, usage) = self.authorize_use(
            &parent,
            UsageKind::Other,
            &ctx,
            Some(Capability::CreateMytoken),
        )?;
        let parent = parent.stored;

        validate_all(&request.restrictions)
            .map_err(|e| MytokenError::MalformedRequest(e.to_string()))?;

        let ceiling = parent
            .subtoken_capabilities
            .as_ref()
            .unwrap_or(&parent.capabilities);
        let capabilities = request
            .capabilities
            .unwrap_or_else(|| CapabilitySet::from([Capability::AccessToken]));
        if capabilities.is_empty() {
            return Err(MytokenError::MalformedRequest(
                "at least one capability is required".into(),
            ));
        }
        check_ceiling(&parent.id, &capabilities, ceiling)?;

        let subtoken_capabilities = request
            .subtoken_capabilities
            .filter(|_| capabilities.has(Capability::CreateMytoken));
        if let Some(subtoken_capabilities) = &subtoken_capabilities {
            check_ceiling(&parent.id, subtoken_capabilities, ceiling)?;
        }

        let claims = MytokenClaims::builder(
            self.config.issuer_url(),
            parent.oidc_iss.as_str(),
            parent.oidc_sub.as_str(),
        )
        .name(request.name)
        .capabilities(capabilities)
        .subtoken_capabilities(subtoken_capabilities)
        .restrictions(request.restrictions)
        .build(now);

        let (mut mytoken, delivery) =
            self.prepare(&claims, None, request.response_type, client, now)?;
        mytoken.parent_id = Some(parent.id);

        let mut events = vec![
            Event::new(EventKind::SubtokenCreated, parent.id, client, now)
                .with_comment(claims.jti.to_string()),
            Event::new(EventKind::Created, claims.jti, client, now)
                .with_comment(format!("subtoken of {}", parent.id)),
        ];
        if mytoken.transfer.is_some() {
            events.push(Event::new(EventKind::TransferCodeCreated, claims.jti, client, now));
        }
        self.store.insert_mytoken(mytoken, usage, events).await?;

        tracing::info!(
            mytoken_id = %claims.jti,
            parent_id = %parent.id,
            response_type = delivery.response_type().as_str(),
            "created child mytoken"
        );
        Ok(IssuedMytoken {
            id: claims.jti,
            delivery,
            expires_at: claims.exp,
            capabilities: claims.capabilities,
            subtoken_capabilities: claims.subtoken_capabilities,
            restrictions: claims.restrictions,
        })
    }

    /// Sign `claims` and build the row and the delivery for `response_type`.
    fn prepare(
        &self,
        claims: &MytokenClaims,
        refresh_token: Option<String>,
        response_type: ResponseType,
        client: &ClientMetaData,
        now: i64,
    ) -> Result<(NewMytoken, Delivery)> {
        let long = codec::encode(claims, &self.keys.current())?;

        let mut mytoken = NewMytoken {
            id: claims.jti,
            parent_id: None,
            oidc_iss: claims.oidc_iss.clone(),
            oidc_sub: claims.oidc_sub.clone(),
            name: claims.name.clone(),
            capabilities: claims.capabilities.clone(),
            subtoken_capabilities: claims.subtoken_capabilities.clone(),
            restrictions: claims.restrictions.clone(),
            created_at: now,
            expires_at: claims.exp,
            ip: client.ip.to_string(),
            refresh_token,
            short_token: None,
            transfer: None,
        };

        let delivery = match response_type {
            ResponseType::Token => Delivery::Token { mytoken: long },
            ResponseType::ShortToken => {
                if !self.config.features.short_tokens {
                    return Err(MytokenError::FeatureDisabled("short tokens"));
                }
                let short = generate_code(self.config.tokens.short_token_length);
                mytoken.short_token = Some(ShortToken {
                    short: short.clone(),
                    long,
                });
                Delivery::ShortToken { mytoken: short }
            }
            ResponseType::TransferCode => {
                if !self.config.features.transfer_codes {
                    return Err(MytokenError::FeatureDisabled("transfer codes"));
                }
                let code = generate_code(self.config.tokens.transfer_code_length);
                let expires_in = self.config.tokens.transfer_code_expires_in;
                mytoken.transfer = Some(NewExchange::transfer(
                    code.clone(),
                    claims.jti,
                    long,
                    now,
                    now + expires_in,
                ));
                Delivery::TransferCode {
                    transfer_code: code,
                    expires_in,
                }
            }
        };

        Ok((mytoken, delivery))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Revocation
    // ─────────────────────────────────────────────────────────────────────────

    /// Revoke the presented mytoken, or another mytoken of the same user.
    ///
    /// Returns the ids that were newly revoked.
    pub async fn revoke(
        &self,
        request: RevokeRequest,
        client: &ClientMetaData,
    ) -> Result<Vec<MytokenId>> {
        let actor = self.authenticate(&request.mytoken).await?;
        let now = self.now();
        let ctx = RequestContext::new(client.ip, now);
        let (_, usage) =
            self.authorize_use(&actor, UsageKind::Other, &ctx, Some(Capability::Revoke))?;
        let actor = actor.stored;

        let target = request.target.unwrap_or(actor.id);
        if target != actor.id {
            let stored = self
                .store
                .get_mytoken(&target)
                .await?
                .ok_or_else(|| MytokenError::MalformedRequest(format!("unknown mytoken {}", target)))?;
            if stored.oidc_iss != actor.oidc_iss || stored.oidc_sub != actor.oidc_sub {
                tracing::warn!(mytoken_id = %actor.id, target = %target, "revocation of foreign mytoken");
                return Err(MytokenError::InsufficientCapability(
                    "the mytoken belongs to another user".into(),
                ));
            }
        }

        let revoked = self
            .store
            .revoke(&target, request.recursive, usage, client, now)
            .await?;
        tracing::info!(
            target = %target,
            recursive = request.recursive,
            count = revoked.len(),
            "revoked mytokens"
        );
        Ok(revoked)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Polling Codes
    // ─────────────────────────────────────────────────────────────────────────

    /// Start a polling-code flow for a new root mytoken.
    pub async fn create_pending_exchange(
        &self,
        mut flow: FlowParameters,
        client: &ClientMetaData,
    ) -> Result<PendingExchange> {
        if !self.config.features.polling_codes {
            return Err(MytokenError::FeatureDisabled("polling codes"));
        }
        let provider = self
            .config
            .provider(&flow.oidc_issuer)
            .ok_or_else(|| MytokenError::UnknownIssuer(flow.oidc_issuer.clone()))?;
        flow.oidc_issuer = provider.issuer.clone();

        validate_all(&flow.restrictions)
            .map_err(|e| MytokenError::MalformedRequest(e.to_string()))?;
        if flow.capabilities.is_empty() {
            return Err(MytokenError::MalformedRequest(
                "at least one capability is required".into(),
            ));
        }
        match flow.response_type {
            ResponseType::TransferCode => {
                return Err(MytokenError::MalformedRequest(
                    "a polling code cannot deliver a transfer code".into(),
                ))
            }
            ResponseType::ShortToken if !self.config.features.short_tokens => {
                return Err(MytokenError::FeatureDisabled("short tokens"))
            }
            _ => {}
        }
        if !flow.capabilities.has(Capability::CreateMytoken) {
            flow.subtoken_capabilities = None;
        }

        let now = self.now();
        let polling = &self.config.polling;
        let polling_code = generate_code(polling.code_length);
        let consent_code = generate_code(polling.consent_code_length);
        let exchange = NewExchange::polling(
            polling_code.clone(),
            consent_code.clone(),
            flow,
            now,
            now + polling.expires_in,
        );
        self.store.insert_exchange(exchange, None, Vec::new()).await?;

        tracing::debug!(ip = %client.ip, "started polling code flow");
        Ok(PendingExchange {
            polling_code,
            consent_uri: format!("{}/c/{}", self.config.issuer_url(), consent_code),
            consent_code,
            expires_in: polling.expires_in,
            interval: polling.interval,
        })
    }

    /// The parameters a pending flow asks the user to consent to.
    pub async fn pending_flow(&self, consent_code: &str) -> Result<FlowParameters> {
        let exchange = self
            .store
            .get_exchange_by_consent_code(consent_code)
            .await?
            .ok_or(ExchangeError::UnknownCode)?;
        match exchange.status().state_at(self.now()) {
            ExchangeState::Pending if exchange.consent == ConsentState::Pending => {
                Ok(exchange.flow.ok_or(ExchangeError::UnknownCode)?)
            }
            ExchangeState::Expired => Err(ExchangeError::Expired.into()),
            _ => Err(ExchangeError::ConsentAlreadyDecided.into()),
        }
    }

    /// Record the user's consent decision.
    pub async fn decide_consent(&self, consent_code: &str, decision: ConsentDecision) -> Result<()> {
        self.store
            .decide_consent(consent_code, decision, self.now())
            .await?;
        tracing::info!(?decision, "recorded consent decision");
        Ok(())
    }

    /// Mint the root mytoken once the user has logged in at the provider,
    /// and attach it to the exchange for the poller.
    pub async fn complete_flow(
        &self,
        consent_code: &str,
        identity: ProviderIdentity,
        client: &ClientMetaData,
    ) -> Result<MytokenId> {
        if identity.subject.is_empty() || identity.refresh_token.is_empty() {
            return Err(MytokenError::MalformedRequest(
                "the provider returned no subject or refresh token".into(),
            ));
        }
        let now = self.now();
        let flow = self
            .store
            .get_exchange_by_consent_code(consent_code)
            .await?
            .and_then(|exchange| exchange.flow)
            .ok_or(ExchangeError::UnknownCode)?;

        let claims = MytokenClaims::builder(
            self.config.issuer_url(),
            flow.oidc_issuer.as_str(),
            identity.subject.as_str(),
        )
        .name(flow.name)
        .capabilities(flow.capabilities)
        .subtoken_capabilities(flow.subtoken_capabilities)
        .restrictions(flow.restrictions)
        .build(now);

        let (mytoken, delivery) = self.prepare(
            &claims,
            Some(identity.refresh_token),
            flow.response_type,
            client,
            now,
        )?;
        let token = match delivery {
            Delivery::Token { mytoken } | Delivery::ShortToken { mytoken } => mytoken,
            Delivery::TransferCode { .. } => {
                return Err(MytokenError::MalformedRequest(
                    "a polling code cannot deliver a transfer code".into(),
                ))
            }
        };

        let events = vec![Event::new(EventKind::Created, claims.jti, client, now)
            .with_comment("polling code flow")];
        self.store
            .complete_exchange(consent_code, mytoken, token, events, now)
            .await?;

        tracing::info!(mytoken_id = %claims.jti, "created root mytoken");
        Ok(claims.jti)
    }

    /// Claim the token attached to a polling or transfer code.
    ///
    /// Succeeds for exactly one caller.
    pub async fn poll(&self, code: &str, client: &ClientMetaData) -> Result<String> {
        match self.store.pop_exchange_token(code, client, self.now()).await {
            Ok(token) => {
                tracing::debug!(ip = %client.ip, "code redeemed");
                Ok(token)
            }
            Err(e) => {
                tracing::debug!(ip = %client.ip, error = %e, "code not redeemed");
                Err(e.into())
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transfer Codes
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a transfer code for the presented mytoken.
    pub async fn create_transfer_code(
        &self,
        mytoken: &str,
        client: &ClientMetaData,
    ) -> Result<TransferCode> {
        if !self.config.features.transfer_codes {
            return Err(MytokenError::FeatureDisabled("transfer codes"));
        }
        let presented = self.authenticate(mytoken).await?;
        let now = self.now();
        let ctx = RequestContext::new(client.ip, now);
        let (_, usage) = self.authorize_use(&presented, UsageKind::Other, &ctx, None)?;

        let id = presented.stored.id;
        let code = generate_code(self.config.tokens.transfer_code_length);
        let expires_in = self.config.tokens.transfer_code_expires_in;
        let exchange = NewExchange::transfer(code.clone(), id, presented.token, now, now + expires_in);
        let events = vec![Event::new(EventKind::TransferCodeCreated, id, client, now)];
        self.store.insert_exchange(exchange, usage, events).await?;

        tracing::info!(mytoken_id = %id, "created transfer code");
        Ok(TransferCode {
            transfer_code: code,
            expires_in,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Token Info
    // ─────────────────────────────────────────────────────────────────────────

    /// Describe the presented mytoken.
    ///
    /// A revoked mytoken is described as such without being charged.
    pub async fn introspect(&self, mytoken: &str, client: &ClientMetaData) -> Result<TokenInfo> {
        let presented = self.authenticate(mytoken).await?;
        if presented.stored.revoked {
            return Ok(TokenInfo::from(presented.stored));
        }
        let id = presented.stored.id;
        self.charge_tokeninfo(
            &presented,
            Capability::TokeninfoIntrospect,
            EventKind::TokeninfoIntrospect,
            client,
        )
        .await?;

        // Reload so the report includes this use.
        let stored = self
            .store
            .get_mytoken(&id)
            .await?
            .ok_or_else(|| MytokenError::InvalidToken("unknown mytoken".into()))?;
        Ok(TokenInfo::from(stored))
    }

    /// The event history of the presented mytoken and its descendants.
    pub async fn history(&self, mytoken: &str, client: &ClientMetaData) -> Result<Vec<Event>> {
        let presented = self.authenticate(mytoken).await?;
        self.charge_tokeninfo(
            &presented,
            Capability::TokeninfoHistory,
            EventKind::TokeninfoHistory,
            client,
        )
        .await?;
        Ok(self.store.history(&presented.stored.id).await?)
    }

    /// All live mytokens of the presented mytoken's user, as trees.
    pub async fn list_mytokens(
        &self,
        mytoken: &str,
        client: &ClientMetaData,
    ) -> Result<Vec<MytokenTree>> {
        let presented = self.authenticate(mytoken).await?;
        self.charge_tokeninfo(
            &presented,
            Capability::ListMytokens,
            EventKind::TokeninfoList,
            client,
        )
        .await?;
        let stored = &presented.stored;
        Ok(self.store.mytoken_trees(&stored.oidc_iss, &stored.oidc_sub).await?)
    }

    async fn charge_tokeninfo(
        &self,
        presented: &Presented,
        capability: Capability,
        kind: EventKind,
        client: &ClientMetaData,
    ) -> Result<()> {
        let now = self.now();
        let ctx = RequestContext::new(client.ip, now);
        let (_, usage) = self.authorize_use(presented, UsageKind::Other, &ctx, Some(capability))?;
        let event = Event::new(kind, presented.stored.id, client, now);
        self.store.record_usage(usage, vec![event]).await?;
        Ok(())
    }
}

fn check_ceiling(
    parent: &MytokenId,
    requested: &CapabilitySet,
    ceiling: &CapabilitySet,
) -> Result<()> {
    let exceeding = requested.exceeding(ceiling);
    if exceeding.is_empty() {
        return Ok(());
    }
    let exceeding: CapabilitySet = exceeding.into_iter().collect();
    tracing::warn!(parent_id = %parent, %exceeding, "child would exceed delegation ceiling");
    Err(MytokenError::CreationRejected(format!(
        "{} may not be delegated",
        exceeding
    )))
}
