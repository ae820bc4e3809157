use stream_relay::config::{DnsFailurePolicy, LogFormat, RelayConfig};
use tempfile::TempDir;

#[test]
fn test_load_example_config() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config.example.yaml");
    let config = RelayConfig::from_file(path);
    assert!(config.is_ok(), "Failed to load example config: {:?}", config.err());

    // The example documents the defaults
    assert_eq!(config.unwrap(), RelayConfig::default());
}

#[test]
fn test_load_minimal_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("minimal.yaml");
    std::fs::write(
        &path,
        r#"
server:
  port: 9000
security:
  dns_failure_policy: deny
  rate_limiting:
    requests_per_minute: 10
logging:
  format: json
"#,
    )
    .unwrap();

    let config = RelayConfig::from_file(&path).unwrap();
    assert_eq!(config.server.port, 9000);
    assert_eq!(config.security.dns_failure_policy, DnsFailurePolicy::Deny);
    assert_eq!(config.security.rate_limiting.requests_per_minute, 10);
    assert_eq!(config.logging.format, LogFormat::Json);

    // Everything else keeps its default
    assert_eq!(config.server.host, "0.0.0.0");
    assert!(config.security.rate_limiting.enabled);
    assert!(config.security.private_ip_blocking);
    assert_eq!(config.proxy.buffer_size, 32 * 1024);
    assert_eq!(config.tracker.retention_secs, 1800);
    assert!(config.metrics_endpoint.is_none());
}

#[test]
fn test_load_invalid_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("invalid.yaml");
    std::fs::write(
        &path,
        r#"
proxy:
  buffer_size: 1024
"#,
    )
    .unwrap();

    let config = RelayConfig::from_file(&path);
    assert!(config.is_err(), "Should fail validation for buffer_size < 4KB");
}

#[test]
fn test_load_unparseable_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.yaml");
    std::fs::write(&path, "server: [not, a, map").unwrap();

    assert!(RelayConfig::from_file(&path).is_err());
}

#[test]
fn test_load_nonexistent_file() {
    let config = RelayConfig::from_file("nonexistent.yaml");
    assert!(config.is_err(), "Should fail when file doesn't exist");
}

#[test]
fn test_load_or_create_writes_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("config.yaml");

    let created = RelayConfig::load_or_create(&path).unwrap();
    assert_eq!(created, RelayConfig::default());
    assert!(path.exists());

    // A second start reads the file it wrote
    let loaded = RelayConfig::load_or_create(&path).unwrap();
    assert_eq!(loaded, created);
}

#[test]
fn test_listen_address() {
    let mut config = RelayConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 8443;
    assert_eq!(config.listen_address().unwrap().to_string(), "127.0.0.1:8443");

    config.server.host = "not an address".to_string();
    assert!(config.listen_address().is_err());
}
