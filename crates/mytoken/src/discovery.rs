//! The server's self-description, served at
//! `/.well-known/mytoken-configuration`.

use mytoken_core::{Capability, ResponseType};
use serde::Serialize;

use crate::config::ServiceConfig;
use crate::handlers::paths;

/// Restriction claims a clause may carry.
pub const RESTRICTION_KEYS: [&str; 7] = [
    "nbf",
    "exp",
    "scope",
    "audience",
    "ip",
    "usages_AT",
    "usages_other",
];

/// A provider as advertised to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupportedProvider {
    pub issuer: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigurationDocument {
    pub issuer: String,
    pub access_token_endpoint: String,
    pub mytoken_endpoint: String,
    pub tokeninfo_endpoint: String,
    pub revocation_endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_transfer_endpoint: Option<String>,
    pub jwks_uri: String,
    pub providers_supported: Vec<SupportedProvider>,
    pub capabilities_supported: Vec<&'static str>,
    pub restriction_claims_supported: Vec<&'static str>,
    pub response_types_supported: Vec<&'static str>,
    pub mytoken_endpoint_grant_types_supported: Vec<&'static str>,
    pub tokeninfo_endpoint_actions_supported: Vec<&'static str>,
}

impl ConfigurationDocument {
    /// Describe a server running with `config`. Disabled features are left
    /// out.
    pub fn new(config: &ServiceConfig) -> Self {
        let base = config.issuer_url();
        let url = |path: &str| format!("{}{}", base, path);
        let features = &config.features;

        let mut response_types = vec![ResponseType::Token.as_str()];
        if features.short_tokens {
            response_types.push(ResponseType::ShortToken.as_str());
        }
        if features.transfer_codes {
            response_types.push(ResponseType::TransferCode.as_str());
        }

        let mut grant_types = vec!["mytoken"];
        if features.polling_codes {
            grant_types.extend(["oidc_flow", "polling_code"]);
        }
        if features.transfer_codes {
            grant_types.push("transfer_code");
        }

        Self {
            issuer: base.to_string(),
            access_token_endpoint: url(paths::ACCESS_TOKEN),
            mytoken_endpoint: url(paths::MYTOKEN),
            tokeninfo_endpoint: url(paths::TOKENINFO),
            revocation_endpoint: url(paths::REVOKE),
            token_transfer_endpoint: features.transfer_codes.then(|| url(paths::TRANSFER)),
            jwks_uri: url(paths::JWKS),
            providers_supported: config
                .providers
                .iter()
                .map(|p| SupportedProvider {
                    issuer: p.issuer.clone(),
                    name: p.name.clone(),
                })
                .collect(),
            capabilities_supported: Capability::ALL.iter().map(|c| c.as_str()).collect(),
            restriction_claims_supported: RESTRICTION_KEYS.to_vec(),
            response_types_supported: response_types,
            mytoken_endpoint_grant_types_supported: grant_types,
            tokeninfo_endpoint_actions_supported: vec![
                "introspect",
                "event_history",
                "list_mytokens",
            ],
        }
    }
}
