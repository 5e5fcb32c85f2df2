//! Environment-driven configuration. No CLI argument parsing: the server
//! reads everything from the process environment, optionally populated from
//! a `.env` file via `dotenv`.

use std::env;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:7878";

pub struct Config {
    pub bind_addr: String,
}

impl Config {
    /// Loads `.env` if present (missing file is not an error, matching
    /// `dotenv`'s usual "best effort" convention) and reads `OTHELLO_BIND_ADDR`,
    /// falling back to [`DEFAULT_BIND_ADDR`] when unset.
    pub fn from_env() -> Config {
        let _ = dotenv::dotenv();
        let bind_addr = env::var("OTHELLO_BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
        Config { bind_addr }
    }
}
