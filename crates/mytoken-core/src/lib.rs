//! # mytoken core
//!
//! Pure primitives for mytoken delegation credentials.
//!
//! This crate contains no I/O and no storage. It defines what a mytoken is,
//! what it may do, and how it travels on the wire.
//!
//! ## Key Types
//!
//! - [`CapabilitySet`] - coarse permission flags and the delegation ceiling
//! - [`Restriction`] - one alternative usage-constraint clause
//! - [`MytokenClaims`] - the claim set carried by a long-form token
//! - [`KeyRing`] - the server's signing key with a rotation hook
//! - [`ExchangeState`] - the pending-exchange state machine
//!
//! ## Authorization
//!
//! [`restriction::authorize`] selects the first clause that admits a request.
//! The caller records the use inside the transaction that performs the
//! operation.

pub mod capability;
pub mod claims;
pub mod codec;
pub mod crypto;
pub mod error;
pub mod event;
pub mod exchange;
pub mod restriction;
pub mod types;

pub use capability::{Capability, CapabilitySet};
pub use claims::{ClaimsBuilder, MytokenClaims};
pub use codec::{ResponseType, WireToken};
pub use crypto::{Ed25519PublicKey, Ed25519Signature, Jwk, Jwks, KeyRing, Keypair};
pub use error::{CoreError, TokenError};
pub use event::{Event, EventKind};
pub use exchange::{
    ConsentDecision, ConsentState, ExchangeError, ExchangeState, ExchangeStatus, FlowParameters,
};
pub use restriction::{
    authorize, Decision, IpRange, RequestContext, Restriction, Usage, UsageKind, UsedRestriction,
};
pub use types::{unix_now, ClientMetaData, MytokenId};
