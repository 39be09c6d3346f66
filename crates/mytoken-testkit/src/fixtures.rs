//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mytoken::provider::{IdentityProvider, ProviderConfig, ProviderError, ProviderTokens};
use mytoken::service::{MytokenService, ProviderIdentity};
use mytoken::ServiceConfig;
use mytoken_core::{
    CapabilitySet, ClientMetaData, ConsentDecision, FlowParameters, KeyRing, Restriction,
};
use mytoken_store::SqliteStore;

/// This server's issuer in fixtures.
pub const ISSUER: &str = "https://mytoken.example";
/// The identity provider configured in fixtures.
pub const PROVIDER: &str = "https://idp.example";
/// The subject the mock provider logs every user in as.
pub const SUBJECT: &str = "alice";
/// Start of the fixture clock.
pub const EPOCH: i64 = 1_700_000_000;

/// One call the mock provider received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshCall {
    pub issuer: String,
    pub refresh_token: String,
    pub scopes: Vec<String>,
    pub audiences: Vec<String>,
}

#[derive(Default)]
struct MockInner {
    scripted: Mutex<VecDeque<Result<ProviderTokens, ProviderError>>>,
    calls: Mutex<Vec<RefreshCall>>,
    issued: AtomicU64,
}

/// A scripted identity provider.
///
/// Answers with queued responses first and with a fresh access token once
/// the queue is empty. Clones share their script and call log.
#[derive(Clone, Default)]
pub struct MockProvider {
    inner: Arc<MockInner>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the answer to the next refresh.
    pub fn push(&self, response: Result<ProviderTokens, ProviderError>) {
        if let Ok(mut scripted) = self.inner.scripted.lock() {
            scripted.push_back(response);
        }
    }

    /// Queue a rejection of the next refresh.
    pub fn reject_next(&self, status: u16, error: &str) {
        self.push(Err(ProviderError::Rejected {
            status,
            error: error.to_string(),
            description: None,
        }));
    }

    /// The refreshes received so far.
    pub fn calls(&self) -> Vec<RefreshCall> {
        self.inner
            .calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl IdentityProvider for MockProvider {
    async fn refresh(
        &self,
        provider: &ProviderConfig,
        refresh_token: &str,
        scopes: &[String],
        audiences: &[String],
    ) -> Result<ProviderTokens, ProviderError> {
        if let Ok(mut calls) = self.inner.calls.lock() {
            calls.push(RefreshCall {
                issuer: provider.issuer.clone(),
                refresh_token: refresh_token.to_string(),
                scopes: scopes.to_vec(),
                audiences: audiences.to_vec(),
            });
        }
        let scripted = self
            .inner
            .scripted
            .lock()
            .ok()
            .and_then(|mut scripted| scripted.pop_front());
        if let Some(response) = scripted {
            return response;
        }

        let n = self.inner.issued.fetch_add(1, Ordering::SeqCst);
        Ok(ProviderTokens {
            access_token: format!("at-{}", n),
            token_type: "Bearer".into(),
            expires_in: Some(3600),
            scope: (!scopes.is_empty()).then(|| scopes.join(" ")),
            refresh_token: None,
        })
    }
}

/// The configuration fixtures run with.
pub fn test_config() -> ServiceConfig {
    ServiceConfig {
        issuer: ISSUER.into(),
        providers: vec![ProviderConfig::new(PROVIDER).with_scopes(["openid", "profile"])],
        ..ServiceConfig::default()
    }
}

/// A service over an in-memory store, a scripted provider, and a clock the
/// test controls.
pub struct TestFixture {
    pub service: Arc<MytokenService<SqliteStore, MockProvider>>,
    pub provider: MockProvider,
    clock: Arc<AtomicI64>,
}

impl TestFixture {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ServiceConfig) -> Self {
        let provider = MockProvider::new();
        let clock = Arc::new(AtomicI64::new(EPOCH));
        let store = match SqliteStore::open_memory() {
            Ok(store) => store,
            Err(e) => panic!("in-memory store: {}", e),
        };
        let now = Arc::clone(&clock);
        let service = MytokenService::new(config, store, provider.clone(), KeyRing::generate())
            .with_clock(move || now.load(Ordering::SeqCst));
        Self {
            service: Arc::new(service),
            provider,
            clock,
        }
    }

    /// The fixture clock.
    pub fn now(&self) -> i64 {
        self.clock.load(Ordering::SeqCst)
    }

    pub fn advance(&self, secs: i64) {
        self.clock.fetch_add(secs, Ordering::SeqCst);
    }

    /// A client at 192.0.2.10.
    pub fn client(&self) -> ClientMetaData {
        client_at(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)))
    }

    /// The identity the mock login reports.
    pub fn identity(&self) -> ProviderIdentity {
        ProviderIdentity {
            subject: SUBJECT.into(),
            refresh_token: "rt-root".into(),
        }
    }

    /// Run a whole polling-code flow and return the claimed token.
    pub async fn root_from_flow(&self, flow: FlowParameters) -> String {
        let client = self.client();
        let service = &self.service;
        let run = async {
            let pending = service.create_pending_exchange(flow, &client).await?;
            service
                .decide_consent(&pending.consent_code, ConsentDecision::Grant)
                .await?;
            service
                .complete_flow(&pending.consent_code, self.identity(), &client)
                .await?;
            service.poll(&pending.polling_code, &client).await
        };
        match run.await {
            Ok(token) => token,
            Err(e) => panic!("polling code flow failed: {}", e),
        }
    }

    /// A root mytoken with the given capabilities and restrictions.
    pub async fn root_mytoken(
        &self,
        capabilities: CapabilitySet,
        restrictions: Vec<Restriction>,
    ) -> String {
        let mut flow = FlowParameters::new(PROVIDER);
        flow.capabilities = capabilities;
        flow.restrictions = restrictions;
        self.root_from_flow(flow).await
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Metadata of a client at `ip`.
pub fn client_at(ip: IpAddr) -> ClientMetaData {
    ClientMetaData::new(ip).with_user_agent("mytoken-testkit")
}
