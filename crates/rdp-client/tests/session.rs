//! End-to-end sessions against the scripted server from `test-utils`.
#![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

use std::io;
use std::time::Duration;

use proptest::prelude::*;
use rdp_client::rdp_proto;
use rdp_client::rdp_proto::fast_path::{FastPathInputEvent, KeyboardFlags};
use rdp_client::rdp_proto::gcc::EncryptionMethod;
use rdp_client::rdp_proto::license::LicenseErrorCode;
use rdp_client::rdp_proto::nego::{FailureCode, NegotiatedProtocol, ProtocolSet};
use rdp_client::rdp_proto::share::ErrorInfo;
use rdp_client::rdp_proto::update::BitmapData;
use rdp_client::{
    ClientConfig, Credentials, NegotiationFailure, RdpClient, RdpError, RdpEvent, RdpResult, UpdateRectangle,
};
use rstest::rstest;
use test_utils::{Ending, LicenseReply, ScriptedUpdate, ServerReport, ServerScript, solid_rectangle};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();

    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

fn config(password: &str) -> ClientConfig {
    ClientConfig::builder()
        .credentials(
            Credentials::builder()
                .domain("CONTOSO")
                .username("alice")
                .password(password)
                .build(),
        )
        .build()
}

struct Outcome {
    result: RdpResult<()>,
    events: Vec<RdpEvent>,
    report: ServerReport,
}

impl Outcome {
    fn names(&self) -> Vec<&'static str> {
        self.events.iter().map(RdpEvent::name).collect()
    }

    fn updates(&self) -> Vec<Vec<UpdateRectangle>> {
        self.events
            .iter()
            .filter_map(|event| match event {
                RdpEvent::Update(rectangles) => Some(rectangles.clone()),
                _ => None,
            })
            .collect()
    }

    fn error(&self) -> &RdpError {
        self.result.as_ref().unwrap_err()
    }
}

/// Logs in against `script`. Once the session is ready, sends `input` and asks for a shutdown when
/// the script waits for one.
async fn session(config: ClientConfig, script: ServerScript, input: Vec<FastPathInputEvent>) -> Outcome {
    init_tracing();

    let shutdown_on_ready = script.ending == Ending::AwaitShutdown;
    let (stream, server) = test_utils::start(script);

    let (client, mut events) = RdpClient::new(config).unwrap();
    let handle = client.handle();
    let login = tokio::spawn(client.login(stream));

    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(TEST_TIMEOUT, events.recv())
            .await
            .unwrap()
            .unwrap();

        if matches!(event, RdpEvent::Ready) && shutdown_on_ready {
            if !input.is_empty() {
                handle.send_input(input.clone()).await.unwrap();
            }
            handle.shutdown().await.unwrap();
        }

        let close = matches!(event, RdpEvent::Close);
        seen.push(event);
        if close {
            break;
        }
    }

    let result = tokio::time::timeout(TEST_TIMEOUT, login).await.unwrap().unwrap();
    let report = tokio::time::timeout(TEST_TIMEOUT, server).await.unwrap().unwrap().unwrap();

    // Nothing follows the close event.
    assert!(events.recv().await.is_none());

    Outcome {
        result,
        events: seen,
        report,
    }
}

fn rectangles(bitmaps: &[BitmapData]) -> Vec<UpdateRectangle> {
    bitmaps.iter().cloned().map(UpdateRectangle::from).collect()
}

#[tokio::test]
async fn hybrid_session_reports_ready_logon_updates_then_success() {
    let first = vec![solid_rectangle(0, 0, 8, 8)];
    let second = vec![solid_rectangle(8, 0, 4, 4), solid_rectangle(12, 0, 4, 4)];
    let third = vec![solid_rectangle(100, 100, 16, 16)];

    let script = ServerScript {
        early_user_auth: Some(0),
        updates: vec![
            ScriptedUpdate::FastPathBitmap(first.clone()),
            ScriptedUpdate::SlowPathBitmap(second.clone()),
            ScriptedUpdate::FragmentedBitmap(third.clone()),
        ],
        ..ServerScript::default()
    };

    let outcome = session(config("hunter2"), script, Vec::new()).await;

    outcome.result.as_ref().unwrap();
    assert_eq!(
        outcome.names(),
        ["ready", "logon", "update", "update", "update", "success", "close"]
    );
    assert_eq!(
        outcome.updates(),
        [rectangles(&first), rectangles(&second), rectangles(&third)]
    );

    let report = outcome.report;
    assert_eq!(report.selected, Some(NegotiatedProtocol::HybridCredentialDelegation));
    assert!(report.authenticated);
    assert!(!report.encrypted);
    assert_eq!(report.cookie.as_deref(), Some("alice"));
    assert_eq!(report.joined_channels, [1007, 1003]);
    assert_eq!(report.client_info.as_ref().unwrap().username, "alice");
    assert_eq!(
        report.client_pdus,
        [
            "ConfirmActive",
            "Synchronize",
            "Control",
            "Control",
            "FontList",
            "ShutdownRequest"
        ]
    );
    assert!(report.shutdown_requested);
    assert!(report.disconnect_received);
}

#[tokio::test]
async fn wrong_password_is_rejected_before_ready() {
    let outcome = session(config("letmein"), ServerScript::default(), Vec::new()).await;

    assert!(matches!(outcome.error(), RdpError::AuthenticationRejected(_)));
    assert_eq!(outcome.names(), ["error", "close"]);
    assert!(!outcome.report.authenticated);
    assert!(!outcome.report.mcs_connected);
}

#[tokio::test]
async fn early_user_authorization_denial_is_an_authentication_failure() {
    let script = ServerScript {
        early_user_auth: Some(5),
        ..ServerScript::default()
    };

    let outcome = session(config("hunter2"), script, Vec::new()).await;

    assert!(matches!(outcome.error(), RdpError::AuthenticationRejected(_)));
    assert!(outcome.report.authenticated);
    assert!(!outcome.report.mcs_connected);
}

#[rstest]
#[case::no_common_protocol(ProtocolSet::HYBRID, None, FailureCode::HYBRID_REQUIRED_BY_SERVER)]
#[case::tls_required(ProtocolSet::TRANSPORT_ENCRYPTED, None, FailureCode::SSL_REQUIRED_BY_SERVER)]
#[case::server_refusal(ProtocolSet::all(), Some(FailureCode::SSL_CERT_NOT_ON_SERVER), FailureCode::SSL_CERT_NOT_ON_SERVER)]
#[tokio::test]
async fn negotiation_failure_stops_before_any_channel(
    #[case] allowed: ProtocolSet,
    #[case] failure: Option<FailureCode>,
    #[case] expected: FailureCode,
) {
    let mut config = config("hunter2");
    config.protocols = ProtocolSet::PLAIN;

    let script = ServerScript {
        protocols: allowed,
        failure,
        ..ServerScript::default()
    };

    let outcome = session(config, script, Vec::new()).await;

    match outcome.error() {
        RdpError::NegotiationRejected(NegotiationFailure::Server(code)) => assert_eq!(*code, expected),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(outcome.names(), ["error", "close"]);
    assert!(!outcome.report.mcs_connected);
    assert!(outcome.report.selected.is_none());
}

#[tokio::test]
async fn refused_channel_join_fails_channel_setup() {
    let mut config = config("hunter2");
    config.protocols = ProtocolSet::TRANSPORT_ENCRYPTED;
    config.channels = vec!["rdpdr".to_owned(), "cliprdr".to_owned()];

    let script = ServerScript {
        refused_channel: Some(1005),
        ..ServerScript::default()
    };

    let outcome = session(config, script, Vec::new()).await;

    assert!(matches!(outcome.error(), RdpError::ChannelSetupFailed(1005)));
    assert_eq!(outcome.names(), ["error", "close"]);
    assert_eq!(outcome.report.joined_channels, [1007, 1003, 1004]);
    assert!(outcome.report.client_info.is_none());
}

#[rstest]
#[case::bit_40(EncryptionMethod::BIT_40, false)]
#[case::bit_56(EncryptionMethod::BIT_56, false)]
#[case::bit_128(EncryptionMethod::BIT_128, false)]
#[case::bit_128_salted(EncryptionMethod::BIT_128, true)]
#[tokio::test]
async fn standard_security_session_carries_updates_and_input(
    #[case] method: EncryptionMethod,
    #[case] salted_checksum: bool,
) {
    let fast_path = vec![solid_rectangle(0, 0, 4, 4)];
    let slow_path = vec![solid_rectangle(4, 4, 2, 2)];

    let script = ServerScript {
        salted_checksum,
        updates: vec![
            ScriptedUpdate::FastPathBitmap(fast_path.clone()),
            ScriptedUpdate::SlowPathBitmap(slow_path.clone()),
        ],
        ..ServerScript::standard_security(method)
    };

    let input = vec![
        FastPathInputEvent::Scancode {
            flags: KeyboardFlags::empty(),
            code: 0x1E,
        },
        FastPathInputEvent::Scancode {
            flags: KeyboardFlags::RELEASE,
            code: 0x1E,
        },
        FastPathInputEvent::Unicode {
            release: false,
            code: u16::from(b'a'),
        },
    ];

    let outcome = session(config("hunter2"), script, input.clone()).await;

    outcome.result.as_ref().unwrap();
    assert_eq!(
        outcome.names(),
        ["ready", "logon", "update", "update", "success", "close"]
    );
    assert_eq!(outcome.updates(), [rectangles(&fast_path), rectangles(&slow_path)]);
    assert_eq!(outcome.report.selected, Some(NegotiatedProtocol::Plain));
    assert!(outcome.report.encrypted);
    assert_eq!(outcome.report.input_events, input);
}

#[tokio::test]
async fn license_platform_challenge_is_answered() {
    let script = ServerScript {
        license: LicenseReply::Challenge,
        ..ServerScript::standard_security(EncryptionMethod::BIT_128)
    };

    let outcome = session(config("hunter2"), script, Vec::new()).await;

    outcome.result.as_ref().unwrap();
    assert!(outcome.report.license_challenge_answered);
    assert_eq!(outcome.names(), ["ready", "logon", "success", "close"]);
}

#[tokio::test]
async fn license_denial_ends_the_connection() {
    let script = ServerScript {
        license: LicenseReply::Deny(LicenseErrorCode::NO_LICENSE),
        ..ServerScript::default()
    };

    let outcome = session(config("hunter2"), script, Vec::new()).await;

    assert!(matches!(
        outcome.error(),
        RdpError::LicenseDenied(LicenseErrorCode::NO_LICENSE)
    ));
    assert_eq!(outcome.names(), ["error", "close"]);
    assert!(outcome.report.confirm_active.is_none());
}

#[rstest]
#[case::security_exchange(ServerScript::standard_security(EncryptionMethod::BIT_128))]
#[case::license_request(ServerScript { license: LicenseReply::Challenge, ..ServerScript::default() })]
#[tokio::test]
async fn zero_modulus_certificate_fails_the_connection(#[case] script: ServerScript) {
    let script = ServerScript {
        zero_modulus_certificate: true,
        ..script
    };

    let outcome = session(config("hunter2"), script, Vec::new()).await;

    assert!(matches!(
        outcome.error(),
        RdpError::Decode(rdp_proto::Error::InvalidField { field: "modulus", .. })
    ));
    assert_eq!(outcome.names(), ["error", "close"]);
    assert!(!outcome.report.encrypted);
    assert!(!outcome.report.license_challenge_answered);
}

#[tokio::test]
async fn malformed_batch_does_not_block_the_next_one() {
    let before = vec![solid_rectangle(0, 0, 2, 2)];
    let after = vec![solid_rectangle(2, 2, 2, 2)];

    let script = ServerScript {
        updates: vec![
            ScriptedUpdate::FastPathBitmap(before.clone()),
            ScriptedUpdate::Malformed,
            ScriptedUpdate::FastPathBitmap(after.clone()),
        ],
        ..ServerScript::default()
    };

    let outcome = session(config("hunter2"), script, Vec::new()).await;

    outcome.result.as_ref().unwrap();
    assert_eq!(
        outcome.names(),
        ["ready", "logon", "update", "error", "update", "success", "close"]
    );
    assert!(matches!(outcome.events[3], RdpEvent::Error(RdpError::Decode(_))));
    assert_eq!(outcome.updates(), [rectangles(&before), rectangles(&after)]);
}

#[tokio::test]
async fn peer_hangup_mid_updates_closes_once() {
    let batches: Vec<_> = (0..5).map(|i| vec![solid_rectangle(i * 8, 0, 8, 8)]).collect();

    let script = ServerScript {
        updates: batches.iter().cloned().map(ScriptedUpdate::FastPathBitmap).collect(),
        ending: Ending::Hangup,
        ..ServerScript::default()
    };

    let outcome = session(config("hunter2"), script, Vec::new()).await;

    assert!(matches!(outcome.error(), RdpError::ConnectionLost(_)));
    assert_eq!(outcome.names().iter().filter(|name| **name == "close").count(), 1);
    assert_eq!(outcome.names().last(), Some(&"close"));
    assert_eq!(outcome.updates().len(), batches.len());
}

#[tokio::test]
async fn server_disconnect_carries_error_info() {
    let script = ServerScript {
        ending: Ending::Disconnect(ErrorInfo::RPC_INITIATED_DISCONNECT),
        ..ServerScript::default()
    };

    let outcome = session(config("hunter2"), script, Vec::new()).await;

    let RdpError::ConnectionLost(error) = outcome.error() else {
        panic!("unexpected error: {:?}", outcome.error());
    };
    assert_eq!(error.kind(), io::ErrorKind::ConnectionAborted);
    assert!(error.to_string().contains("(0x1)"));
    assert_eq!(outcome.names(), ["ready", "logon", "error", "close"]);
}

#[tokio::test]
async fn out_of_order_finalization_is_a_protocol_violation() {
    let script = ServerScript {
        swap_finalization: true,
        ..ServerScript::default()
    };

    let outcome = session(config("hunter2"), script, Vec::new()).await;

    assert!(matches!(outcome.error(), RdpError::Protocol(_)));
    assert_eq!(outcome.names(), ["error", "close"]);
    // The server saw a clean close, not a truncated stream.
    assert!(outcome.report.confirm_active.is_some());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn updates_arrive_in_wire_order(batches in prop::collection::vec((test_utils::bitmap_batch(), any::<bool>()), 1..6)) {
        let updates = batches
            .iter()
            .map(|(batch, fast_path)| {
                if *fast_path {
                    ScriptedUpdate::FastPathBitmap(batch.clone())
                } else {
                    ScriptedUpdate::SlowPathBitmap(batch.clone())
                }
            })
            .collect();

        let script = ServerScript {
            protocols: ProtocolSet::PLAIN,
            updates,
            ..ServerScript::default()
        };

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let outcome = runtime.block_on(session(config("hunter2"), script, Vec::new()));

        let expected: Vec<_> = batches.iter().map(|(batch, _)| rectangles(batch)).collect();
        prop_assert!(outcome.result.is_ok());
        prop_assert_eq!(outcome.updates(), expected);
    }
}
