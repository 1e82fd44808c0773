use url::Url;

use crate::config::Config;
use crate::error::{DakaraError, Result};

pub const TRUNCATE_LIMIT: usize = 100;

/// Builds the URL of a server endpoint from a server config section.
///
/// Either `url` is given, or `address` (alias `host`) with the optional `port`
/// and `ssl` keys. `path` is appended to the resulting URL. HTTP schemes of a
/// given `url` are swapped for `scheme_no_ssl`/`scheme_ssl`, so the same
/// section serves both the HTTP and the WebSocket clients.
pub fn create_url(
    config: &Config,
    path: &str,
    scheme_no_ssl: &str,
    scheme_ssl: &str,
) -> Result<Url> {
    let mut url = match config.get_str("url") {
        Some(raw) => {
            let mut url = Url::parse(&raw)?;
            let scheme = match url.scheme() {
                "http" => Some(scheme_no_ssl),
                "https" => Some(scheme_ssl),
                _ => None,
            };
            if let Some(scheme) = scheme {
                url.set_scheme(scheme).map_err(|_| {
                    DakaraError::ParameterError(format!(
                        "Unable to use scheme '{}' for '{}'",
                        scheme, raw
                    ))
                })?;
            }
            url
        }
        None => {
            let host = config
                .get_str("address")
                .or_else(|| config.get_str("host"))
                .ok_or_else(|| {
                    DakaraError::ParameterError(
                        "Unable to set URL: specify either 'url' or 'address' in config file"
                            .to_string(),
                    )
                })?;
            let scheme = if config.get_bool("ssl")?.unwrap_or(false) {
                scheme_ssl
            } else {
                scheme_no_ssl
            };
            let authority = match config.get_parsed::<u16>("port")? {
                Some(port) => format!("{}:{}", host, port),
                None => host,
            };
            Url::parse(&format!("{}://{}/", scheme, authority))?
        }
    };

    if !url.path().ends_with('/') {
        let with_slash = format!("{}/", url.path());
        url.set_path(&with_slash);
    }
    Ok(url.join(path.trim_start_matches('/'))?)
}

/// First `limit` characters of a message, ending with `...` when cut.
pub fn display_message(message: &str, limit: usize) -> String {
    if message.chars().count() <= limit {
        return message.to_string();
    }

    let kept: String = message.chars().take(limit.saturating_sub(3)).collect();
    format!("{}...", kept.trim())
}

pub fn truncate_message(message: &str) -> String {
    display_message(message, TRUNCATE_LIMIT)
}

/// Reads a truthy or falsy word (`y`, `yes`, `t`, `true`, `on`, `1` and their
/// negations), case insensitive.
pub fn strtobool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "y" | "yes" | "t" | "true" | "on" | "1" => Some(true),
        "n" | "no" | "f" | "false" | "off" | "0" => Some(false),
        _ => None,
    }
}
