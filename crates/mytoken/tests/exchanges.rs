//! Polling codes, consent, and transfer codes.

use mytoken::core::{
    Capability, CapabilitySet, ConsentDecision, ExchangeError, FlowParameters, ResponseType,
};
use mytoken::{ChildRequest, Delivery, MytokenError};
use mytoken_testkit::fixtures::{TestFixture, PROVIDER};

fn exchange_error(result: Result<impl std::fmt::Debug, MytokenError>) -> ExchangeError {
    match result {
        Err(MytokenError::Exchange(e)) => e,
        other => panic!("expected an exchange error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_polling_code_flow() {
    let fixture = TestFixture::new();
    let service = &fixture.service;
    let client = fixture.client();

    let mut flow = FlowParameters::new("https://idp.example/");
    flow.capabilities = CapabilitySet::from([Capability::AccessToken, Capability::CreateMytoken]);
    flow.name = Some("cli".into());
    let pending = service.create_pending_exchange(flow, &client).await.unwrap();
    assert_eq!(pending.expires_in, 300);
    assert_eq!(pending.interval, 5);
    assert!(pending.consent_uri.ends_with(&pending.consent_code));
    assert_ne!(pending.polling_code, pending.consent_code);

    // Nothing to claim before consent.
    assert_eq!(
        exchange_error(service.poll(&pending.polling_code, &client).await),
        ExchangeError::AuthorizationPending
    );

    let shown = service.pending_flow(&pending.consent_code).await.unwrap();
    assert_eq!(shown.oidc_issuer, PROVIDER);
    assert_eq!(shown.name.as_deref(), Some("cli"));

    service
        .decide_consent(&pending.consent_code, ConsentDecision::Grant)
        .await
        .unwrap();
    // Granted but the login has not finished yet.
    assert_eq!(
        exchange_error(service.poll(&pending.polling_code, &client).await),
        ExchangeError::AuthorizationPending
    );

    let id = service
        .complete_flow(&pending.consent_code, fixture.identity(), &client)
        .await
        .unwrap();
    let token = service.poll(&pending.polling_code, &client).await.unwrap();

    let presented = service.authenticate(&token).await.unwrap();
    assert_eq!(presented.stored.id, id);
    assert_eq!(presented.claims.name.as_deref(), Some("cli"));
    assert_eq!(presented.claims.sub, "alice@https://idp.example");

    assert_eq!(
        exchange_error(service.poll(&pending.polling_code, &client).await),
        ExchangeError::AlreadyClaimed
    );
}

#[tokio::test]
async fn test_declined_consent_stays_declined() {
    let fixture = TestFixture::new();
    let service = &fixture.service;
    let client = fixture.client();

    let pending = service
        .create_pending_exchange(FlowParameters::new(PROVIDER), &client)
        .await
        .unwrap();
    service
        .decide_consent(&pending.consent_code, ConsentDecision::Decline)
        .await
        .unwrap();

    let first = service.poll(&pending.polling_code, &client).await;
    assert_eq!(exchange_error(first), ExchangeError::ConsentDeclined);

    fixture.advance(30);
    let err = service.poll(&pending.polling_code, &client).await.unwrap_err();
    assert_eq!(err.status(), 401);
    assert_eq!(err.to_api_error().error, "access_denied");

    // The decision cannot be changed, and the flow cannot finish.
    assert_eq!(
        exchange_error(
            service
                .decide_consent(&pending.consent_code, ConsentDecision::Grant)
                .await
        ),
        ExchangeError::ConsentAlreadyDecided
    );
    assert_eq!(
        exchange_error(
            service
                .complete_flow(&pending.consent_code, fixture.identity(), &client)
                .await
        ),
        ExchangeError::ConsentDeclined
    );
}

#[tokio::test]
async fn test_flow_without_consent_cannot_complete() {
    let fixture = TestFixture::new();
    let service = &fixture.service;
    let client = fixture.client();

    let pending = service
        .create_pending_exchange(FlowParameters::new(PROVIDER), &client)
        .await
        .unwrap();
    assert_eq!(
        exchange_error(
            service
                .complete_flow(&pending.consent_code, fixture.identity(), &client)
                .await
        ),
        ExchangeError::ConsentRequired
    );
}

#[tokio::test]
async fn test_expired_polling_code() {
    let fixture = TestFixture::new();
    let service = &fixture.service;
    let client = fixture.client();

    let pending = service
        .create_pending_exchange(FlowParameters::new(PROVIDER), &client)
        .await
        .unwrap();
    service
        .decide_consent(&pending.consent_code, ConsentDecision::Grant)
        .await
        .unwrap();
    service
        .complete_flow(&pending.consent_code, fixture.identity(), &client)
        .await
        .unwrap();

    // Usable up to and including the expiry second.
    fixture.advance(pending.expires_in + 1);
    let err = service.poll(&pending.polling_code, &client).await;
    assert_eq!(exchange_error(err), ExchangeError::Expired);
}

#[tokio::test]
async fn test_unknown_codes() {
    let fixture = TestFixture::new();
    let client = fixture.client();
    assert_eq!(
        exchange_error(fixture.service.poll("nosuchcode", &client).await),
        ExchangeError::UnknownCode
    );
    assert_eq!(
        exchange_error(
            fixture
                .service
                .decide_consent("nosuchcode", ConsentDecision::Grant)
                .await
        ),
        ExchangeError::UnknownCode
    );
}

#[tokio::test]
async fn test_flow_validation() {
    let fixture = TestFixture::new();
    let client = fixture.client();

    let err = fixture
        .service
        .create_pending_exchange(FlowParameters::new("https://unknown.example"), &client)
        .await
        .unwrap_err();
    assert!(matches!(err, MytokenError::UnknownIssuer(_)));

    let mut flow = FlowParameters::new(PROVIDER);
    flow.response_type = ResponseType::TransferCode;
    let err = fixture
        .service
        .create_pending_exchange(flow, &client)
        .await
        .unwrap_err();
    assert!(matches!(err, MytokenError::MalformedRequest(_)));

    let mut flow = FlowParameters::new(PROVIDER);
    flow.capabilities = CapabilitySet::new();
    let err = fixture
        .service
        .create_pending_exchange(flow, &client)
        .await
        .unwrap_err();
    assert!(matches!(err, MytokenError::MalformedRequest(_)));
}

#[tokio::test]
async fn test_flow_drops_subtoken_capabilities_without_create() {
    let fixture = TestFixture::new();
    let mut flow = FlowParameters::new(PROVIDER);
    flow.subtoken_capabilities = Some(CapabilitySet::all());
    let token = fixture.root_from_flow(flow).await;

    let presented = fixture.service.authenticate(&token).await.unwrap();
    assert_eq!(presented.stored.subtoken_capabilities, None);
}

#[tokio::test]
async fn test_flow_with_short_token() {
    let fixture = TestFixture::new();
    let mut flow = FlowParameters::new(PROVIDER);
    flow.response_type = ResponseType::ShortToken;
    let short = fixture.root_from_flow(flow).await;

    assert!(!short.contains('.'));
    assert!(fixture.service.authenticate(&short).await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_granted_exchange_is_claimed_exactly_once() {
    let fixture = TestFixture::new();
    let service = &fixture.service;
    let client = fixture.client();

    let pending = service
        .create_pending_exchange(FlowParameters::new(PROVIDER), &client)
        .await
        .unwrap();
    service
        .decide_consent(&pending.consent_code, ConsentDecision::Grant)
        .await
        .unwrap();
    service
        .complete_flow(&pending.consent_code, fixture.identity(), &client)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let service = fixture.service.clone();
        let client = fixture.client();
        let code = pending.polling_code.clone();
        handles.push(tokio::spawn(async move { service.poll(&code, &client).await }));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(token) => claimed.push(token),
            Err(MytokenError::Exchange(ExchangeError::AlreadyClaimed)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(claimed.len(), 1);
}

#[tokio::test]
async fn test_transfer_code_moves_mytoken() {
    let fixture = TestFixture::new();
    let token = fixture
        .root_mytoken(CapabilitySet::from([Capability::AccessToken]), vec![])
        .await;
    let client = fixture.client();

    let transfer = fixture
        .service
        .create_transfer_code(&token, &client)
        .await
        .unwrap();
    assert_eq!(transfer.transfer_code.len(), 8);
    assert_eq!(transfer.expires_in, 300);

    let received = fixture
        .service
        .poll(&transfer.transfer_code, &client)
        .await
        .unwrap();
    assert_eq!(received, token);

    let err = fixture.service.poll(&transfer.transfer_code, &client).await;
    assert_eq!(exchange_error(err), ExchangeError::AlreadyClaimed);
}

#[tokio::test]
async fn test_transfer_code_expires() {
    let fixture = TestFixture::new();
    let token = fixture
        .root_mytoken(CapabilitySet::from([Capability::AccessToken]), vec![])
        .await;
    let client = fixture.client();

    let transfer = fixture
        .service
        .create_transfer_code(&token, &client)
        .await
        .unwrap();
    fixture.advance(transfer.expires_in + 1);

    let err = fixture.service.poll(&transfer.transfer_code, &client).await;
    assert_eq!(exchange_error(err), ExchangeError::Expired);
}

#[tokio::test]
async fn test_child_delivered_by_transfer_code() {
    let fixture = TestFixture::new();
    let root = fixture
        .root_mytoken(
            CapabilitySet::from([Capability::AccessToken, Capability::CreateMytoken]),
            vec![],
        )
        .await;
    let client = fixture.client();

    let issued = fixture
        .service
        .create_child(
            ChildRequest {
                mytoken: root,
                response_type: ResponseType::TransferCode,
                ..ChildRequest::default()
            },
            &client,
        )
        .await
        .unwrap();
    let Delivery::TransferCode { transfer_code, .. } = issued.delivery else {
        panic!("expected a transfer code");
    };

    let token = fixture.service.poll(&transfer_code, &client).await.unwrap();
    let presented = fixture.service.authenticate(&token).await.unwrap();
    assert_eq!(presented.stored.id, issued.id);
}

#[tokio::test]
async fn test_transfer_codes_can_be_disabled() {
    let mut config = mytoken_testkit::test_config();
    config.features.transfer_codes = false;
    let fixture = TestFixture::with_config(config);
    let token = fixture
        .root_mytoken(CapabilitySet::from([Capability::AccessToken]), vec![])
        .await;

    let err = fixture
        .service
        .create_transfer_code(&token, &fixture.client())
        .await
        .unwrap_err();
    assert!(matches!(err, MytokenError::FeatureDisabled(_)));
}
