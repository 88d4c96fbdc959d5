//! Integration tests for RelayConfig loading

use config::Config;
use rtprelay::{DriveMode, Error, RelayConfig, TransportKind};
use std::io::Write;
use std::net::SocketAddr;
use std::time::Duration;

fn config_from(pairs: &[(&str, &str)]) -> Config {
    let mut builder = Config::builder();
    for (key, value) in pairs {
        builder = builder.set_override(*key, *value).unwrap();
    }
    builder.build().unwrap()
}

#[test]
fn empty_config_uses_defaults() {
    let relay_config = RelayConfig::from_config(&Config::default()).unwrap();

    assert_eq!(relay_config, RelayConfig::default());
    assert_eq!(relay_config.transport, TransportKind::Tcp);
    assert_eq!(relay_config.listen_addr, "0.0.0.0:15000".parse::<SocketAddr>().unwrap());
    assert_eq!(relay_config.drive_mode, DriveMode::External);
    assert_eq!(relay_config.poll_interval, Duration::from_millis(1000));
    assert_eq!(relay_config.accept_poll_interval, Duration::from_millis(200));
    assert_eq!(relay_config.max_packet_size, 1564);
    assert_eq!(relay_config.max_send_backlog, rtprelay::DEFAULT_MAX_SEND_BACKLOG);
    assert!(!relay_config.accept_own_packets);
}

#[test]
fn keys_override_defaults() {
    let config = config_from(&[
        ("transport_type", "udp"),
        ("listen_addr", "127.0.0.1:9001"),
        ("drive_mode", "internal"),
        ("poll_interval_ms", "250"),
        ("max_packet_size", "2048"),
        ("max_send_backlog", "8192"),
        ("accept_own_packets", "true"),
    ]);
    let relay_config = RelayConfig::from_config(&config).unwrap();

    assert_eq!(relay_config.transport, TransportKind::Udp);
    assert_eq!(relay_config.listen_addr, "127.0.0.1:9001".parse::<SocketAddr>().unwrap());
    assert_eq!(relay_config.drive_mode, DriveMode::Internal);
    assert_eq!(relay_config.poll_interval, Duration::from_millis(250));
    assert_eq!(relay_config.max_packet_size, 2048);
    assert!(relay_config.accept_own_packets);

    let params = relay_config.session_params();
    assert_eq!(params.max_packet_size, 2048);
    assert_eq!(params.max_send_backlog, 8192);
    assert_eq!(params.drive_mode, DriveMode::Internal);
    assert!(params.accept_own_packets);
}

#[test]
fn namespaced_keys_take_precedence() {
    let config = config_from(&[
        ("poll_interval_ms", "700"),
        ("camera.poll_interval_ms", "300"),
        ("other.poll_interval_ms", "900"),
    ]);

    let named = RelayConfig::from_config_named(&config, "camera").unwrap();
    assert_eq!(named.poll_interval, Duration::from_millis(300));

    let fallback = RelayConfig::from_config_named(&config, "missing").unwrap();
    assert_eq!(fallback.poll_interval, Duration::from_millis(700));
}

#[test]
fn invalid_values_are_reported() {
    let result = RelayConfig::from_config(&config_from(&[("transport_type", "sctp")]));
    match result {
        Err(Error::InvalidTransportType { got, valid }) => {
            assert_eq!(got, "sctp");
            assert_eq!(valid, vec!["tcp", "udp"]);
        }
        other => panic!("expected invalid transport type, got {other:?}"),
    }

    let result = RelayConfig::from_config(&config_from(&[("drive_mode", "sometimes")]));
    assert!(matches!(result, Err(Error::InvalidDriveMode { .. })));

    let result = RelayConfig::from_config(&config_from(&[("max_packet_size", "4")]));
    assert!(matches!(result, Err(Error::InvalidConfigValue { .. })));

    // Smaller than one framed packet of the default size.
    let result = RelayConfig::from_config(&config_from(&[("max_send_backlog", "1000")]));
    assert!(matches!(result, Err(Error::InvalidConfigValue { .. })));

    let result = RelayConfig::from_config(&config_from(&[("listen_addr", "not an address")]));
    assert!(matches!(result, Err(Error::InvalidAddress(_))));

    let result = RelayConfig::from_config(&config_from(&[("poll_interval_ms", "soon")]));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn loads_from_toml_file() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
transport_type = "tcp"
listen_addr = "127.0.0.1:15500"

[feed]
drive_mode = "internal"
accept_poll_interval_ms = 50
"#
    )
    .unwrap();

    let config = Config::builder()
        .add_source(config::File::from(file.path()))
        .build()
        .unwrap();
    let relay_config = RelayConfig::from_config_named(&config, "feed").unwrap();

    assert_eq!(relay_config.listen_addr.port(), 15500);
    assert_eq!(relay_config.drive_mode, DriveMode::Internal);
    assert_eq!(relay_config.accept_poll_interval, Duration::from_millis(50));
    assert_eq!(relay_config.poll_interval, Duration::from_millis(1000));
}
