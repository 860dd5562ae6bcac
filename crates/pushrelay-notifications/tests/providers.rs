use std::io::Write;

use pushrelay_notifications::{
    ApnsAdapter, ApnsConfig, ApnsTokenConfig, DeliveryStatus, FcmAdapter, FcmConfig, MessageMeta,
    MessageType, MultiDeviceMessage, ProviderClient, PushError, PushProvider, SendReport,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, body_string_contains, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const APNS_KEY: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/apns_signing_key.p8");
const SERVICE_ACCOUNT_KEY: &str = include_str!("fixtures/service_account_key.pem");

fn message(provider: PushProvider, tokens: &[&str], meta: MessageMeta) -> MultiDeviceMessage {
    MultiDeviceMessage::new(
        tokens.iter().copied(),
        provider,
        MessageType::CheckEchoV1,
        meta,
        false,
    )
}

fn status_of<'a>(report: &'a SendReport, token: &str) -> &'a DeliveryStatus {
    &report
        .outcomes
        .iter()
        .find(|o| o.token == token)
        .unwrap()
        .status
}

// =============================================================================
// APNs
// =============================================================================

fn apns_adapter(endpoint: &str) -> ApnsAdapter {
    let config = ApnsConfig {
        enabled: true,
        endpoint: Some(endpoint.to_string()),
        default_topic: Some("org.wikimedia.app".into()),
        token: Some(ApnsTokenConfig {
            key: APNS_KEY.into(),
            key_id: "ABC123DEFG".into(),
            team_id: "DEF123GHIJ".into(),
        }),
        ..ApnsConfig::default()
    };
    ApnsAdapter::from_config(&config, None).unwrap()
}

fn apns_error(status: u16, reason: &str) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_json(json!({ "reason": reason }))
}

#[tokio::test]
async fn apns_reports_per_token_outcomes() {
    let server = MockServer::start().await;
    for (token, response) in [
        ("good", ResponseTemplate::new(200)),
        ("gone", apns_error(410, "Unregistered")),
        ("bad", apns_error(400, "BadDeviceToken")),
        ("busy", apns_error(429, "TooManyRequests")),
    ] {
        Mock::given(method("POST"))
            .and(path(format!("/3/device/{token}")))
            .and(header("apns-topic", "org.wikimedia.app"))
            .and(header("apns-push-type", "background"))
            .and(header_exists("authorization"))
            .respond_with(response)
            .expect(1)
            .mount(&server)
            .await;
    }

    let adapter = apns_adapter(&server.uri());
    let report = adapter
        .send(&message(
            PushProvider::Apns,
            &["good", "gone", "bad", "busy"],
            MessageMeta::default(),
        ))
        .await
        .unwrap();

    assert_eq!(report.success_count(), 1);
    assert_eq!(report.failed_tokens(), vec!["gone".to_string(), "bad".to_string()]);
    assert_eq!(
        status_of(&report, "busy"),
        &DeliveryStatus::Deferred {
            reason: "TooManyRequests".into()
        }
    );
}

#[tokio::test]
async fn apns_message_topic_overrides_default() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/3/device/good"))
        .and(header("apns-topic", "org.wikimedia.beta"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = apns_adapter(&server.uri());
    let report = adapter
        .send(&message(
            PushProvider::Apns,
            &["good"],
            MessageMeta::with_topic("org.wikimedia.beta"),
        ))
        .await
        .unwrap();

    assert_eq!(report.success_count(), 1);
}

#[tokio::test]
async fn apns_dry_run_never_reaches_gateway() {
    let server = MockServer::start().await;
    let adapter = apns_adapter(&server.uri());

    let mut dry = message(PushProvider::Apns, &["a", "b"], MessageMeta::default());
    dry.dry_run = true;
    let report = adapter.send(&dry).await.unwrap();

    assert!(report.dry_run);
    assert_eq!(report.success_count(), 2);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn apns_crafted_tokens_cannot_retarget_the_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/3/device/victim"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(apns_error(400, "BadDeviceToken"))
        .mount(&server)
        .await;

    let adapter = apns_adapter(&server.uri());
    let report = adapter
        .send(&message(
            PushProvider::Apns,
            &["victim?x=1", "zz/../victim", ".."],
            MessageMeta::default(),
        ))
        .await
        .unwrap();

    assert_eq!(report.success_count(), 0);
    assert_eq!(
        report.failed_tokens(),
        vec!["victim?x=1".to_string(), "zz/../victim".to_string(), "..".to_string()]
    );

    // ".." never leaves the process
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    for request in &requests {
        assert_eq!(request.url.query(), None);
        assert_eq!(request.url.path_segments().unwrap().count(), 3);
        assert_ne!(request.url.path(), "/3/device/victim");
    }
}

#[tokio::test]
async fn apns_unreachable_gateway_fails_the_batch() {
    let adapter = apns_adapter("http://127.0.0.1:1");

    let err = adapter
        .send(&message(PushProvider::Apns, &["a"], MessageMeta::default()))
        .await
        .unwrap_err();

    assert!(matches!(err, PushError::SendFailed(_)));
}

// =============================================================================
// FCM
// =============================================================================

fn fcm_error(status: u16, code: &str, fcm_code: Option<&str>) -> ResponseTemplate {
    let details = match fcm_code {
        Some(fcm_code) => json!([{
            "@type": "type.googleapis.com/google.firebase.fcm.v1.FcmError",
            "errorCode": fcm_code
        }]),
        None => json!([]),
    };
    ResponseTemplate::new(status).set_body_json(json!({
        "error": { "code": status, "status": code, "details": details }
    }))
}

#[tokio::test]
async fn fcm_reports_per_token_outcomes() {
    let server = MockServer::start().await;
    for (token, response) in [
        (
            "good",
            ResponseTemplate::new(200)
                .set_body_json(json!({ "name": "projects/test-project/messages/1" })),
        ),
        ("gone", fcm_error(404, "NOT_FOUND", Some("UNREGISTERED"))),
        ("later", fcm_error(503, "UNAVAILABLE", None)),
    ] {
        Mock::given(method("POST"))
            .and(path("/v1/projects/test-project/messages:send"))
            .and(header("authorization", "Bearer ya29.static"))
            .and(body_partial_json(json!({
                "message": { "token": token, "data": { "type": "checkEchoV1" } }
            })))
            .respond_with(response)
            .expect(1)
            .mount(&server)
            .await;
    }

    let config = FcmConfig {
        enabled: true,
        endpoint: Some(server.uri()),
        project_id: Some("test-project".into()),
        access_token: Some("ya29.static".into()),
        ..FcmConfig::default()
    };
    let adapter = FcmAdapter::from_config(&config, None).unwrap();

    let report = adapter
        .send(&message(
            PushProvider::Fcm,
            &["good", "gone", "later"],
            MessageMeta::default(),
        ))
        .await
        .unwrap();

    assert_eq!(report.failed_tokens(), vec!["gone".to_string()]);
    assert_eq!(
        status_of(&report, "later"),
        &DeliveryStatus::Deferred {
            reason: "UNAVAILABLE".into()
        }
    );
}

#[tokio::test]
async fn fcm_service_account_token_is_exchanged_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains(
            "grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer",
        ))
        .and(body_string_contains("assertion="))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "ya29.service",
            "expires_in": 3599,
            "token_type": "Bearer"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/projects/sa-project/messages:send"))
        .and(header("authorization", "Bearer ya29.service"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "m" })))
        .expect(2)
        .mount(&server)
        .await;

    let mut credentials = tempfile::NamedTempFile::new().unwrap();
    let key = json!({
        "type": "service_account",
        "project_id": "sa-project",
        "private_key_id": "key-1",
        "private_key": SERVICE_ACCOUNT_KEY,
        "client_email": "relay@sa-project.iam.gserviceaccount.com",
        "token_uri": format!("{}/token", server.uri()),
    });
    write!(credentials, "{key}").unwrap();

    let config = FcmConfig {
        enabled: true,
        endpoint: Some(server.uri()),
        credentials_path: Some(credentials.path().to_string_lossy().into_owned()),
        ..FcmConfig::default()
    };
    let adapter = FcmAdapter::from_config(&config, None).unwrap();

    for token in ["first", "second"] {
        let report = adapter
            .send(&message(PushProvider::Fcm, &[token], MessageMeta::default()))
            .await
            .unwrap();
        assert_eq!(report.success_count(), 1);
    }
}

#[tokio::test]
async fn fcm_rejected_token_exchange_fails_the_batch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant"
        })))
        .mount(&server)
        .await;

    let mut credentials = tempfile::NamedTempFile::new().unwrap();
    let key = json!({
        "project_id": "sa-project",
        "private_key": SERVICE_ACCOUNT_KEY,
        "client_email": "relay@sa-project.iam.gserviceaccount.com",
        "token_uri": format!("{}/token", server.uri()),
    });
    write!(credentials, "{key}").unwrap();

    let config = FcmConfig {
        enabled: true,
        endpoint: Some(server.uri()),
        credentials_path: Some(credentials.path().to_string_lossy().into_owned()),
        ..FcmConfig::default()
    };
    let adapter = FcmAdapter::from_config(&config, None).unwrap();

    let err = adapter
        .send(&message(PushProvider::Fcm, &["a"], MessageMeta::default()))
        .await
        .unwrap_err();

    assert!(matches!(err, PushError::ProviderAuth(_)));
}
