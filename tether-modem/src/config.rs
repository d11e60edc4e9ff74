//! # config - Network and transport settings
//!
//! The defaults match the field device. Any of them can be overridden with
//! a `TETHER_*` environment variable.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use std::env;
use std::str::FromStr;

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
	/// Access point name for the packet data context (`TETHER_APN`)
	pub apn: String,
	/// Which packet data context to use (`TETHER_CONTEXT_ID`)
	pub context_id: u8,
	/// Remote port for HTTP connections (`TETHER_PORT`)
	pub port: u16,
	/// Overall budget for reading the status line, the headers and the
	/// body of a response (`TETHER_READ_TIMEOUT_MS`)
	pub read_timeout_ms: u64,
	/// Size of the AT response buffer (`TETHER_BUFFER_CAPACITY`)
	pub buffer_capacity: usize,
	/// Largest response body we will allocate (`TETHER_MAX_BODY_LEN`)
	pub max_body_len: usize,
	/// How many times a request is tried before it is dropped
	/// (`TETHER_MAX_ATTEMPTS`)
	pub max_attempts: u32,
}

// ****************************************************************************
//
// Public Functions
//
// ****************************************************************************

impl Config {
	/// The defaults, overridden from the process environment.
	pub fn from_env() -> Config {
		Config::default().with_vars(env::vars())
	}

	/// Apply any `TETHER_*` overrides found in `vars`. Values which don't
	/// parse are logged and ignored.
	pub fn with_vars<I>(mut self, vars: I) -> Config
	where
		I: IntoIterator<Item = (String, String)>,
	{
		for (key, value) in vars {
			match key.as_str() {
				"TETHER_APN" => self.apn = value,
				"TETHER_CONTEXT_ID" => parse_into(&key, &value, &mut self.context_id),
				"TETHER_PORT" => parse_into(&key, &value, &mut self.port),
				"TETHER_READ_TIMEOUT_MS" => parse_into(&key, &value, &mut self.read_timeout_ms),
				"TETHER_BUFFER_CAPACITY" => parse_into(&key, &value, &mut self.buffer_capacity),
				"TETHER_MAX_BODY_LEN" => parse_into(&key, &value, &mut self.max_body_len),
				"TETHER_MAX_ATTEMPTS" => parse_into(&key, &value, &mut self.max_attempts),
				_ => {}
			}
		}
		self
	}
}

impl Default for Config {
	fn default() -> Config {
		Config {
			apn: String::from("internet.com"),
			context_id: 1,
			port: 80,
			read_timeout_ms: 30_000,
			buffer_capacity: 512,
			max_body_len: 64 * 1024,
			max_attempts: 3,
		}
	}
}

// ****************************************************************************
//
// Private Functions
//
// ****************************************************************************

fn parse_into<T: FromStr>(key: &str, value: &str, field: &mut T) {
	match value.trim().parse() {
		Ok(v) => *field = v,
		Err(_) => warn!("Ignoring {}={:?} - can't parse it", key, value),
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn vars(list: &[(&str, &str)]) -> Vec<(String, String)> {
		list.iter()
			.map(|&(k, v)| (k.to_owned(), v.to_owned()))
			.collect()
	}

	#[test]
	fn overrides_from_vars() {
		let cfg = Config::default().with_vars(vars(&[
			("TETHER_APN", "m2m.example"),
			("TETHER_PORT", "8080"),
			("TETHER_CONTEXT_ID", "3"),
			("TETHER_MAX_ATTEMPTS", "5"),
			("PATH", "/usr/bin"),
		]));
		assert_eq!(cfg.apn, "m2m.example");
		assert_eq!(cfg.port, 8080);
		assert_eq!(cfg.context_id, 3);
		assert_eq!(cfg.max_attempts, 5);
		assert_eq!(cfg.read_timeout_ms, 30_000);
	}

	#[test]
	fn bad_values_keep_defaults() {
		let cfg = Config::default().with_vars(vars(&[
			("TETHER_PORT", "eighty"),
			("TETHER_CONTEXT_ID", "300"),
		]));
		assert_eq!(cfg, Config::default());
	}
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
