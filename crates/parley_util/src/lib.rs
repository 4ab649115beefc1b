#![forbid(unsafe_code)]

pub mod endpoint {
	use std::fmt;
	use std::net::{SocketAddr, ToSocketAddrs};

	/// Default port a parley server listens on.
	pub const DEFAULT_PORT: u16 = 18204;

	/// Parsed `quic://host:port` endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct QuicEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl QuicEndpoint {
		/// Parse `quic://host:port`. IPv6 hosts must be bracketed.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			let rest = s
				.strip_prefix("quic://")
				.ok_or_else(|| format!("invalid endpoint (expected quic://host:port): {s:?}"))?;

			if rest.contains(['/', '?', '#']) {
				return Err(format!("endpoint must not carry a path, query or fragment: {s}"));
			}

			let (host, port) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("endpoint is missing :port: {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("endpoint host is empty: {s}"));
			}
			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!("IPv6 hosts must be bracketed, e.g. quic://[::1]:{DEFAULT_PORT}: {s}"));
			}

			let port = match port.trim().parse::<u16>() {
				Ok(0) | Err(_) => return Err(format!("endpoint port must be 1..=65535: {s}")),
				Ok(p) => p,
			};

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}

		/// `host:port`, brackets preserved.
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Host without IPv6 brackets, as used for TLS server names.
		pub fn server_name(&self) -> &str {
			self.host.trim_start_matches('[').trim_end_matches(']')
		}

		/// Resolve to the first socket address (DNS names allowed).
		pub fn resolve(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.to_socket_addrs()
				.map_err(|e| format!("failed to resolve {}: {e}", self.hostport()))?
				.next()
				.ok_or_else(|| format!("{} resolved to no addresses", self.hostport()))
		}
	}

	impl fmt::Display for QuicEndpoint {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			write!(f, "quic://{}", self.hostport())
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_hostnames_and_ip_literals() {
			let e = QuicEndpoint::parse("quic://chat.example.com:443").unwrap();
			assert_eq!(e.host, "chat.example.com");
			assert_eq!(e.port, 443);

			let v6 = QuicEndpoint::parse("quic://[::1]:18204").unwrap();
			assert_eq!(v6.hostport(), "[::1]:18204");
			assert_eq!(v6.server_name(), "::1");
			assert_eq!(v6.to_string(), "quic://[::1]:18204");
		}

		#[test]
		fn rejects_malformed() {
			assert!(QuicEndpoint::parse("").is_err());
			assert!(QuicEndpoint::parse("udp://127.0.0.1:1").is_err());
			assert!(QuicEndpoint::parse("quic://::1:18204").unwrap_err().contains("IPv6"));
			assert!(QuicEndpoint::parse("quic://127.0.0.1:18204/x").is_err());
			assert!(QuicEndpoint::parse("quic://127.0.0.1:0").is_err());
			assert!(QuicEndpoint::parse("quic://127.0.0.1").is_err());
		}

		#[test]
		fn resolves_ip_literal() {
			let e = QuicEndpoint::parse("quic://127.0.0.1:18204").unwrap();
			assert_eq!(e.resolve().unwrap().to_string(), "127.0.0.1:18204");
		}
	}
}

pub mod time {
	use std::time::{SystemTime, UNIX_EPOCH};

	/// Current unix time in milliseconds.
	pub fn unix_ms_now() -> i64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_millis() as i64)
			.unwrap_or(0)
	}

	/// Current unix time in seconds.
	pub fn unix_secs_now() -> i64 {
		unix_ms_now() / 1000
	}
}

pub mod env {
	/// Parse a boolean-ish environment value (`1/0`, `true/false`, `yes/no`, `on/off`).
	pub fn parse_bool(v: &str) -> Option<bool> {
		match v.trim().to_ascii_lowercase().as_str() {
			"1" | "true" | "yes" | "on" => Some(true),
			"0" | "false" | "no" | "off" => Some(false),
			_ => None,
		}
	}

	/// Read a non-empty environment variable.
	pub fn var_nonempty(key: &str) -> Option<String> {
		std::env::var(key).ok().filter(|v| !v.trim().is_empty())
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_bool_variants() {
			assert_eq!(parse_bool("YES"), Some(true));
			assert_eq!(parse_bool(" off "), Some(false));
			assert_eq!(parse_bool("maybe"), None);
		}
	}
}
