#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::io::Write as _;
use std::time::Duration;

use super::*;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
	let mut f = tempfile::NamedTempFile::new().expect("tempfile");
	f.write_all(contents.as_bytes()).expect("write config");
	f
}

fn parse(contents: &str) -> anyhow::Result<ServerConfig> {
	let file: FileConfig = toml::from_str(contents)?;
	ServerConfig::from_file(file)
}

#[test]
fn missing_file_yields_defaults_that_need_a_secret() {
	let dir = tempfile::tempdir().expect("tempdir");
	let path = dir.path().join("absent.toml");

	let file = read_toml_if_exists(&path).expect("read");
	assert!(file.is_none());

	let cfg = ServerConfig::from_file(FileConfig::default()).expect("defaults");
	assert_eq!(cfg.database.url, DEFAULT_DATABASE_URL);
	assert_eq!(cfg.broker.kind, BrokerKind::Memory);
	assert_eq!(cfg.auth.token_validity, Duration::from_secs(72 * 3600));
	assert!(cfg.validate().is_err(), "token secret is mandatory");
}

#[test]
fn full_file_is_normalized() {
	let cfg = parse(
		r#"
		[server]
		metrics_bind = "127.0.0.1:9100"
		sink_queue_capacity = 8
		tls_cert_path = ""

		[auth]
		token_secret = "s3cret"
		token_validity_hours = 1

		[database]
		url = "postgres://localhost/parley"

		[broker]
		kind = "postgres"
		channel = "room_fanout"
		publish_attempts = 5
		retry_backoff_ms = 10
		"#,
	)
	.expect("parse");

	assert_eq!(cfg.server.metrics_bind.as_deref(), Some("127.0.0.1:9100"));
	assert_eq!(cfg.server.sink_queue_capacity, 8);
	assert!(cfg.server.tls_cert_path.is_none(), "blank paths are treated as unset");
	assert_eq!(cfg.auth.token_secret.as_ref().map(SecretString::expose), Some("s3cret"));
	assert_eq!(cfg.auth.token_validity, Duration::from_secs(3600));
	assert_eq!(cfg.broker.kind, BrokerKind::Postgres);
	assert_eq!(cfg.broker.effective_url(&cfg.database), "postgres://localhost/parley");
	assert_eq!(cfg.broker.channel, "room_fanout");
	assert_eq!(cfg.broker.publish_attempts, 5);
	assert_eq!(cfg.broker.retry_backoff, Duration::from_millis(10));
	cfg.validate().expect("valid");
}

#[test]
fn unknown_broker_kind_is_rejected() {
	let err = parse("[broker]\nkind = \"kafka\"\n").unwrap_err();
	assert!(format!("{err:#}").contains("unknown broker kind"));
}

#[test]
fn postgres_broker_requires_postgres_url() {
	let cfg = parse("[auth]\ntoken_secret = \"x\"\n[broker]\nkind = \"postgres\"\n").expect("parse");
	let err = cfg.validate().unwrap_err();
	assert!(err.to_string().contains("postgres"));
}

#[test]
fn oversized_token_validity_is_rejected_not_overflowed() {
	let cfg = parse("[auth]\ntoken_secret = \"s\"\ntoken_validity_hours = 18446744073709551\n").expect("parse");
	assert_eq!(cfg.auth.token_validity, Duration::from_secs(u64::MAX));
	let err = cfg.validate().unwrap_err();
	assert!(err.to_string().contains("token_validity_hours"), "{err}");

	let cfg = parse(&format!(
		"[auth]\ntoken_secret = \"s\"\ntoken_validity_hours = {}\n",
		MAX_TOKEN_VALIDITY_HOURS + 1
	))
	.expect("parse");
	assert!(cfg.validate().is_err());

	let cfg = parse(&format!(
		"[auth]\ntoken_secret = \"s\"\ntoken_validity_hours = {MAX_TOKEN_VALIDITY_HOURS}\n"
	))
	.expect("parse");
	cfg.validate().expect("ten years is allowed");

	let mut cfg = parse("[auth]\ntoken_secret = \"s\"\n").expect("parse");
	apply_env_overrides(&mut cfg, |k| {
		(k == "PARLEY_AUTH_TOKEN_VALIDITY_HOURS").then(|| u64::MAX.to_string())
	});
	assert!(cfg.validate().is_err());
}

#[test]
fn env_overrides_win_over_file() {
	let mut cfg = parse("[auth]\ntoken_secret = \"from-file\"\n").expect("parse");

	let env: HashMap<&str, &str> = HashMap::from([
		("PARLEY_AUTH_TOKEN_SECRET", "from-env"),
		("PARLEY_AUTH_TOKEN_VALIDITY_HOURS", "2"),
		("PARLEY_BROKER_PUBLISH_ATTEMPTS", "7"),
		("PARLEY_BROKER_KIND", "bogus"),
		("PARLEY_DEBUG_REGISTRY", "yes"),
	]);
	apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

	assert_eq!(cfg.auth.token_secret.as_ref().map(SecretString::expose), Some("from-env"));
	assert_eq!(cfg.auth.token_validity, Duration::from_secs(7200));
	assert_eq!(cfg.broker.publish_attempts, 7);
	assert_eq!(cfg.broker.kind, BrokerKind::Memory, "invalid kind is ignored");
	assert!(cfg.server.debug_registry);
}

#[test]
fn load_from_path_reads_toml() {
	let f = write_config("[auth]\ntoken_secret = \"abc\"\n[server]\nmax_frame_bytes = 4096\n");
	let cfg = load_server_config_from_path(f.path()).expect("load");
	assert_eq!(cfg.server.max_frame_bytes, 4096);
}

#[test]
fn unknown_sections_are_rejected() {
	let f = write_config("[twitch]\nclient_id = \"x\"\n");
	assert!(load_server_config_from_path(f.path()).is_err());
}

#[test]
fn secret_debug_is_redacted() {
	let s = SecretString::new("hunter2");
	assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
}
