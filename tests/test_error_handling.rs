// Unit tests for the error taxonomy and its HTTP mapping

use http::StatusCode;
use stream_relay::error::RelayError;
use stream_relay::handler::error_response;
use stream_relay::tracker::{is_client_disconnect, TransferOutcome};

#[test]
fn test_target_errors_are_bad_request() {
    let error = RelayError::MalformedTarget("/https:/x".to_string());
    assert_eq!(error.to_http_status(), 400);
    assert_eq!(error.outcome_label(), "malformed");

    let error = RelayError::InvalidTarget("unsupported scheme: ftp".to_string());
    assert_eq!(error.to_http_status(), 400);
    assert_eq!(error.outcome_label(), "invalid");
}

#[test]
fn test_policy_rejections() {
    let error = RelayError::PrivateAddress("10.0.0.5".to_string());
    assert_eq!(error.status_code(), StatusCode::FORBIDDEN);

    let error = RelayError::RateLimited("203.0.113.7".to_string());
    assert_eq!(error.status_code(), StatusCode::TOO_MANY_REQUESTS);
}

#[test]
fn test_upstream_errors_are_bad_gateway() {
    let error = RelayError::UpstreamFailure("connection refused".to_string());
    assert_eq!(error.to_http_status(), 502);

    let error = RelayError::Timeout("no response headers".to_string());
    assert_eq!(error.to_http_status(), 502);
    assert_eq!(error.outcome_label(), "upstream_error");
}

#[test]
fn test_internal_errors_are_server_error() {
    for error in [
        RelayError::InternalFailure("panic".to_string()),
        RelayError::ConfigError("bad".to_string()),
        RelayError::IoError("disk".to_string()),
    ] {
        assert_eq!(error.to_http_status(), 500);
    }
}

#[test]
fn test_io_error_conversion() {
    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    let error: RelayError = io.into();
    assert!(matches!(error, RelayError::IoError(_)));
}

#[test]
fn test_error_response_body_carries_reason() {
    let response = error_response(&RelayError::InvalidTarget("unsupported scheme: ftp".into()));
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/plain; charset=utf-8"
    );
}

#[test]
fn test_streaming_error_classification() {
    assert!(is_client_disconnect("error writing a body to connection: Broken pipe"));
    assert!(is_client_disconnect("Connection reset by peer (os error 104)"));
    assert!(!is_client_disconnect("error decoding response body"));

    assert_eq!(
        TransferOutcome::from_error("context canceled"),
        TransferOutcome::ClientDisconnected
    );
    assert!(matches!(
        TransferOutcome::from_error("unexpected EOF"),
        TransferOutcome::Failed(_)
    ));
}
