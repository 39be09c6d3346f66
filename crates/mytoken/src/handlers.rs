//! Request handlers.
//!
//! Each handler decodes a JSON body, makes one service call, and encodes the
//! result or the error. No handler contains policy; that lives in
//! [`MytokenService`]. Routing and transport are left to the embedding
//! server; [`dispatch`] maps a path to its handler for servers that do not
//! route themselves.

use mytoken_core::restriction::split_list;
use mytoken_core::{
    CapabilitySet, ClientMetaData, ConsentDecision, FlowParameters, MytokenId, ResponseType,
    Restriction, WireToken,
};
use mytoken_store::Store;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::MytokenError;
use crate::provider::IdentityProvider;
use crate::service::{AccessTokenRequest, ChildRequest, MytokenService, RevokeRequest};

/// Endpoint paths, relative to the issuer URL.
pub mod paths {
    pub const ACCESS_TOKEN: &str = "/api/v0/token/access";
    pub const MYTOKEN: &str = "/api/v0/token/my";
    pub const TOKENINFO: &str = "/api/v0/tokeninfo";
    pub const REVOKE: &str = "/api/v0/token/revoke";
    pub const TRANSFER: &str = "/api/v0/token/transfer";
    pub const JWKS: &str = "/jwks";
    pub const CONFIGURATION: &str = "/.well-known/mytoken-configuration";
    /// Prefix of the consent endpoint; the consent code follows.
    pub const CONSENT_PREFIX: &str = "/c/";
}

/// A status code with a JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

impl Response {
    fn ok<T: Serialize>(body: &T) -> Self {
        match serde_json::to_value(body) {
            Ok(body) => Self { status: 200, body },
            Err(e) => {
                tracing::error!(error = %e, "failed to encode response");
                Self::error(&MytokenError::Config(e.to_string()))
            }
        }
    }

    fn error(e: &MytokenError) -> Self {
        let status = e.status();
        if status >= 500 {
            tracing::error!(error = %e, "request failed");
        }
        Self {
            status,
            body: json!(e.to_api_error()),
        }
    }

    fn from_result<T: Serialize>(result: crate::Result<T>) -> Self {
        match result {
            Ok(body) => Self::ok(&body),
            Err(e) => Self::error(&e),
        }
    }

    fn not_found() -> Self {
        Self {
            status: 404,
            body: json!({ "error": "not_found" }),
        }
    }
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> crate::Result<T> {
    serde_json::from_slice(body).map_err(|e| MytokenError::MalformedRequest(e.to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire Requests
// ─────────────────────────────────────────────────────────────────────────────

/// Body of the access-token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessTokenBody {
    /// Always `mytoken`.
    pub grant_type: String,
    pub mytoken: String,
    #[serde(default)]
    pub oidc_issuer: Option<String>,
    /// Space-separated.
    #[serde(default)]
    pub scope: Option<String>,
    /// Space-separated.
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Body of a request for a new root mytoken.
#[derive(Debug, Clone, Deserialize)]
pub struct OidcFlowBody {
    pub oidc_issuer: String,
    #[serde(default)]
    pub restrictions: Vec<Restriction>,
    #[serde(default)]
    pub capabilities: Option<CapabilitySet>,
    #[serde(default)]
    pub subtoken_capabilities: Option<CapabilitySet>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub response_type: ResponseType,
}

impl OidcFlowBody {
    fn into_flow(self) -> FlowParameters {
        let mut flow = FlowParameters::new(self.oidc_issuer);
        flow.restrictions = self.restrictions;
        if let Some(capabilities) = self.capabilities {
            flow.capabilities = capabilities;
        }
        flow.subtoken_capabilities = self.subtoken_capabilities;
        flow.name = self.name;
        flow.response_type = self.response_type;
        flow
    }
}

/// Body of a request for a child mytoken.
#[derive(Debug, Clone, Deserialize)]
pub struct SubtokenBody {
    pub mytoken: String,
    #[serde(default)]
    pub restrictions: Vec<Restriction>,
    #[serde(default)]
    pub capabilities: Option<CapabilitySet>,
    #[serde(default)]
    pub subtoken_capabilities: Option<CapabilitySet>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub response_type: ResponseType,
}

/// Body of the mytoken endpoint, by grant type.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "grant_type", rename_all = "snake_case")]
pub enum MytokenBody {
    OidcFlow(OidcFlowBody),
    Mytoken(SubtokenBody),
    PollingCode { polling_code: String },
    TransferCode { transfer_code: String },
}

/// Body of the tokeninfo endpoint, by action.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TokeninfoBody {
    Introspect { mytoken: String },
    EventHistory { mytoken: String },
    ListMytokens { mytoken: String },
}

/// Body of the revocation endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RevokeBody {
    pub token: String,
    #[serde(default)]
    pub recursive: bool,
    /// Revoke this mytoken of the same user instead of `token`.
    #[serde(default)]
    pub mom_id: Option<MytokenId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferBody {
    pub mytoken: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsentBody {
    pub decision: ConsentDecision,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

pub async fn access_token<S: Store, P: IdentityProvider>(
    service: &MytokenService<S, P>,
    body: &[u8],
    client: &ClientMetaData,
) -> Response {
    let result: crate::Result<_> = async {
        let body: AccessTokenBody = parse(body)?;
        if body.grant_type != "mytoken" {
            return Err(MytokenError::MalformedRequest(format!(
                "unsupported grant_type {}",
                body.grant_type
            )));
        }
        let request = AccessTokenRequest {
            mytoken: body.mytoken,
            oidc_issuer: body.oidc_issuer,
            scopes: body.scope.as_deref().map(split_list).unwrap_or_default(),
            audiences: body.audience.as_deref().map(split_list).unwrap_or_default(),
            comment: body.comment,
        };
        service.issue_access_token(request, client).await
    }
    .await;
    Response::from_result(result)
}

pub async fn mytoken<S: Store, P: IdentityProvider>(
    service: &MytokenService<S, P>,
    body: &[u8],
    client: &ClientMetaData,
) -> Response {
    let body: MytokenBody = match parse(body) {
        Ok(body) => body,
        Err(e) => return Response::error(&e),
    };
    match body {
        MytokenBody::OidcFlow(flow) => {
            Response::from_result(service.create_pending_exchange(flow.into_flow(), client).await)
        }
        MytokenBody::Mytoken(sub) => {
            let request = ChildRequest {
                mytoken: sub.mytoken,
                capabilities: sub.capabilities,
                subtoken_capabilities: sub.subtoken_capabilities,
                restrictions: sub.restrictions,
                name: sub.name,
                response_type: sub.response_type,
            };
            Response::from_result(service.create_child(request, client).await)
        }
        MytokenBody::PollingCode { polling_code: code }
        | MytokenBody::TransferCode {
            transfer_code: code,
        } => Response::from_result(
            service
                .poll(&code, client)
                .await
                .map(|token| redeemed_body(&token)),
        ),
    }
}

fn redeemed_body(token: &str) -> Value {
    let mytoken_type = match WireToken::parse(token) {
        Ok(WireToken::Short(_)) => ResponseType::ShortToken,
        _ => ResponseType::Token,
    };
    json!({ "mytoken": token, "mytoken_type": mytoken_type.as_str() })
}

pub async fn tokeninfo<S: Store, P: IdentityProvider>(
    service: &MytokenService<S, P>,
    body: &[u8],
    client: &ClientMetaData,
) -> Response {
    let body: TokeninfoBody = match parse(body) {
        Ok(body) => body,
        Err(e) => return Response::error(&e),
    };
    match body {
        TokeninfoBody::Introspect { mytoken } => {
            Response::from_result(service.introspect(&mytoken, client).await)
        }
        TokeninfoBody::EventHistory { mytoken } => Response::from_result(
            service
                .history(&mytoken, client)
                .await
                .map(|events| json!({ "events": events })),
        ),
        TokeninfoBody::ListMytokens { mytoken } => Response::from_result(
            service
                .list_mytokens(&mytoken, client)
                .await
                .map(|trees| json!({ "mytokens": trees })),
        ),
    }
}

pub async fn revoke<S: Store, P: IdentityProvider>(
    service: &MytokenService<S, P>,
    body: &[u8],
    client: &ClientMetaData,
) -> Response {
    let result: crate::Result<_> = async {
        let body: RevokeBody = parse(body)?;
        let request = RevokeRequest {
            mytoken: body.token,
            target: body.mom_id,
            recursive: body.recursive,
        };
        service.revoke(request, client).await
    }
    .await;
    Response::from_result(result.map(|revoked| json!({ "revoked": revoked })))
}

pub async fn transfer<S: Store, P: IdentityProvider>(
    service: &MytokenService<S, P>,
    body: &[u8],
    client: &ClientMetaData,
) -> Response {
    let result: crate::Result<_> = async {
        let body: TransferBody = parse(body)?;
        service.create_transfer_code(&body.mytoken, client).await
    }
    .await;
    Response::from_result(result)
}

/// The consent screen: an empty body shows the pending flow, a body with a
/// decision records it.
pub async fn consent<S: Store, P: IdentityProvider>(
    service: &MytokenService<S, P>,
    consent_code: &str,
    body: &[u8],
) -> Response {
    if body.is_empty() {
        return Response::from_result(service.pending_flow(consent_code).await);
    }
    let result: crate::Result<Value> = async {
        let body: ConsentBody = parse(body)?;
        service.decide_consent(consent_code, body.decision).await?;
        Ok(json!({ "decision": body.decision }))
    }
    .await;
    Response::from_result(result)
}

pub fn jwks<S: Store, P: IdentityProvider>(service: &MytokenService<S, P>) -> Response {
    Response::ok(&service.jwks())
}

pub fn configuration<S: Store, P: IdentityProvider>(service: &MytokenService<S, P>) -> Response {
    Response::ok(&service.discovery())
}

/// Route `path` to its handler.
pub async fn dispatch<S: Store, P: IdentityProvider>(
    service: &MytokenService<S, P>,
    path: &str,
    body: &[u8],
    client: &ClientMetaData,
) -> Response {
    tracing::debug!(path, ip = %client.ip, "handling request");
    match path {
        paths::ACCESS_TOKEN => access_token(service, body, client).await,
        paths::MYTOKEN => mytoken(service, body, client).await,
        paths::TOKENINFO => tokeninfo(service, body, client).await,
        paths::REVOKE => revoke(service, body, client).await,
        paths::TRANSFER => transfer(service, body, client).await,
        paths::JWKS => jwks(service),
        paths::CONFIGURATION => configuration(service),
        _ => match path.strip_prefix(paths::CONSENT_PREFIX) {
            Some(code) if !code.is_empty() => consent(service, code, body).await,
            _ => Response::not_found(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mytoken_core::Capability;

    #[test]
    fn test_mytoken_body_dispatches_on_grant_type() {
        let body: MytokenBody = serde_json::from_str(
            r#"{"grant_type":"oidc_flow","oidc_issuer":"https://idp.example","capabilities":["AT","create_mytoken"]}"#,
        )
        .unwrap();
        let MytokenBody::OidcFlow(flow) = body else {
            panic!("expected oidc_flow");
        };
        let flow = flow.into_flow();
        assert!(flow.capabilities.has(Capability::CreateMytoken));
        assert_eq!(flow.response_type, ResponseType::Token);

        let body: MytokenBody =
            serde_json::from_str(r#"{"grant_type":"polling_code","polling_code":"abc"}"#).unwrap();
        assert!(matches!(body, MytokenBody::PollingCode { polling_code } if polling_code == "abc"));

        assert!(serde_json::from_str::<MytokenBody>(r#"{"grant_type":"password"}"#).is_err());
    }

    #[test]
    fn test_oidc_flow_defaults_to_access_tokens_only() {
        let body: OidcFlowBody =
            serde_json::from_str(r#"{"oidc_issuer":"https://idp.example"}"#).unwrap();
        let flow = body.into_flow();
        assert_eq!(flow.capabilities, CapabilitySet::from([Capability::AccessToken]));
    }

    #[test]
    fn test_tokeninfo_actions() {
        let body: TokeninfoBody =
            serde_json::from_str(r#"{"action":"event_history","mytoken":"x.y.z"}"#).unwrap();
        assert!(matches!(body, TokeninfoBody::EventHistory { .. }));
    }

    #[test]
    fn test_redeemed_body_reports_token_type() {
        assert_eq!(redeemed_body("a.b.c")["mytoken_type"], "token");
        assert_eq!(redeemed_body("abcdef0123")["mytoken_type"], "short_token");
    }
}
