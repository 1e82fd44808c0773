use log::{debug, error, info};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::config::Config;
use crate::error::{DakaraError, Result};
use crate::utils::{create_url, truncate_message};

pub const AUTHENTICATE_ENDPOINT: &str = "accounts/login/";
const DEFAULT_TIMEOUT_SECONDS: u64 = 10;
const DEFAULT_ERROR_MESSAGE: &str = "Unable to request the server";

/// Builds the error raised for an unsuccessful response, from its status and body.
pub type ErrorMapper = fn(StatusCode, &str) -> DakaraError;

/// Client for a JSON API authenticated with a token.
///
/// The token comes either from the config or from a login/password exchange
/// with [`HttpClient::authenticate`].
///
/// # Examples
///
/// ```no_run
/// use dakara_base::config::load_config;
/// use dakara_base::http::HttpClient;
///
/// #[tokio::main]
/// async fn main() -> dakara_base::Result<()> {
///     let config = load_config("player.yaml".as_ref(), false, &["server"])?;
///     let mut client = HttpClient::new(&config.section("server"), "api/", false)?;
///     client.load()?;
///     client.authenticate().await?;
///     let songs = client.get("library/songs/").await?;
///     println!("{:?}", songs);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    http_client: Client,
    server_url: Url,
    token: Option<String>,
    login: Option<String>,
    password: Option<String>,
    /// Log response errors and return `None` instead of failing. Never applies
    /// to authentication.
    mute_raise: bool,
}

impl HttpClient {
    pub fn new(config: &Config, endpoint_prefix: &str, mute_raise: bool) -> Result<Self> {
        let server_url = create_url(config, endpoint_prefix, "http", "https")?;
        let http_client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECONDS))
            .build()?;

        Ok(Self {
            http_client,
            server_url,
            token: config.get_str("token"),
            login: config.get_str("login"),
            password: config.get_str("password"),
            mute_raise,
        })
    }

    pub fn server_url(&self) -> &Url {
        &self.server_url
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Checks that credentials are available.
    pub fn load(&self) -> Result<()> {
        let has_token = self.token.as_deref().map_or(false, |t| !t.is_empty());
        let has_login = self.login.as_deref().map_or(false, |l| !l.is_empty())
            && self.password.as_deref().map_or(false, |p| !p.is_empty());

        if !has_token && !has_login {
            return Err(DakaraError::ParameterError(
                "You have to either specify 'token' or the couple 'login' and 'password' in config file"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Exchanges login and password for a token. Does nothing if a token is
    /// already known.
    pub async fn authenticate(&mut self) -> Result<()> {
        if self.token.is_some() {
            return Ok(());
        }

        let data = serde_json::json!({
            "login": self.login,
            "password": self.password,
        });

        debug!("Authenticate to the server");
        let body = self
            .send_request_raw(
                Method::POST,
                AUTHENTICATE_ENDPOINT,
                Some(&data),
                HeaderMap::new(),
                "Unable to authenticate to the server",
                Some(authentication_error),
            )
            .await?;

        let token = parse_body(&body)?
            .as_ref()
            .and_then(|value| value.get("token"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                DakaraError::AuthenticationError("No token in authentication response".to_string())
            })?;

        info!("Login to server successful");
        debug!("Token: {}", token);
        self.token = Some(token);
        Ok(())
    }

    /// Authorization header carrying the token.
    pub fn token_header(&self) -> Result<HeaderMap> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| DakaraError::NotAuthenticated("No connection established".to_string()))?;
        let value = HeaderValue::from_str(&format!("Token {}", token))
            .map_err(|e| DakaraError::ParameterError(format!("Invalid token: {}", e)))?;

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value);
        Ok(headers)
    }

    pub async fn get(&self, endpoint: &str) -> Result<Option<Value>> {
        self.send_request(Method::GET, endpoint, None, None).await
    }

    pub async fn post<T: Serialize + ?Sized>(&self, endpoint: &str, body: &T) -> Result<Option<Value>> {
        let body = serde_json::to_value(body)?;
        self.send_request(Method::POST, endpoint, Some(&body), None)
            .await
    }

    pub async fn put<T: Serialize + ?Sized>(&self, endpoint: &str, body: &T) -> Result<Option<Value>> {
        let body = serde_json::to_value(body)?;
        self.send_request(Method::PUT, endpoint, Some(&body), None).await
    }

    pub async fn patch<T: Serialize + ?Sized>(&self, endpoint: &str, body: &T) -> Result<Option<Value>> {
        let body = serde_json::to_value(body)?;
        self.send_request(Method::PATCH, endpoint, Some(&body), None)
            .await
    }

    pub async fn delete(&self, endpoint: &str) -> Result<Option<Value>> {
        self.send_request(Method::DELETE, endpoint, None, None).await
    }

    /// Sends an authenticated request, by method name.
    pub async fn request(
        &self,
        method: &str,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Option<Value>> {
        let method = match method.to_lowercase().as_str() {
            "get" => Method::GET,
            "post" => Method::POST,
            "put" => Method::PUT,
            "patch" => Method::PATCH,
            "delete" => Method::DELETE,
            other => {
                return Err(DakaraError::MethodError(format!(
                    "Method {} not supported",
                    other
                )))
            }
        };
        self.send_request(method, endpoint, body, None).await
    }

    /// Sends an authenticated request and parses its JSON body.
    ///
    /// `on_error` builds the error of an unsuccessful response; by default it
    /// is a [`DakaraError::ResponseInvalidError`].
    pub async fn send_request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
        on_error: Option<ErrorMapper>,
    ) -> Result<Option<Value>> {
        let headers = self.token_header()?;
        let outcome = self
            .send_request_raw(method, endpoint, body, headers, DEFAULT_ERROR_MESSAGE, on_error)
            .await;

        match outcome {
            Ok(text) => parse_body(&text),
            Err(
                e @ (DakaraError::ResponseRequestError(_) | DakaraError::ResponseInvalidError { .. }),
            ) if self.mute_raise => {
                debug!("Muted response error: {}", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn send_request_raw(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
        headers: HeaderMap,
        message_on_error: &str,
        on_error: Option<ErrorMapper>,
    ) -> Result<String> {
        let url = self.server_url.join(endpoint.trim_start_matches('/'))?;
        debug!("Sending {} request to {}", method, url);

        let mut request = self.http_client.request(method, url).headers(headers);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            error!("{}, communication error", message_on_error);
            DakaraError::ResponseRequestError(format!(
                "Error when communicating with the server: {}",
                e
            ))
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            DakaraError::ResponseRequestError(format!("Unable to read server response: {}", e))
        })?;

        if status.is_success() {
            return Ok(text);
        }

        if let Some(on_error) = on_error {
            return Err(on_error(status, &text));
        }

        error!("{}", message_on_error);
        debug!("Error {}: {}", status.as_u16(), truncate_message(&text));
        Err(DakaraError::ResponseInvalidError {
            status,
            message: format!(
                "Error {} when communicating with the server: {}",
                status.as_u16(),
                text
            ),
        })
    }
}

fn authentication_error(status: StatusCode, body: &str) -> DakaraError {
    if status == StatusCode::BAD_REQUEST {
        return DakaraError::AuthenticationError(
            "Login to server failed, check the config file".to_string(),
        );
    }

    DakaraError::AuthenticationError(format!(
        "Unable to authenticate to the server, error {}: {}",
        status.as_u16(),
        truncate_message(body)
    ))
}

fn parse_body(text: &str) -> Result<Option<Value>> {
    if text.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(text)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: Value) -> Config {
        Config::from_value("TESTHTTP", value).unwrap()
    }

    #[test]
    fn test_load_requires_credentials() {
        let client = HttpClient::new(&config(json!({"address": "localhost"})), "api/", false).unwrap();
        assert!(matches!(client.load(), Err(DakaraError::ParameterError(_))));

        let client = HttpClient::new(
            &config(json!({"address": "localhost", "login": "user", "password": "pass"})),
            "api/",
            false,
        )
        .unwrap();
        assert!(client.load().is_ok());

        let client = HttpClient::new(
            &config(json!({"address": "localhost", "token": "abc"})),
            "api/",
            false,
        )
        .unwrap();
        assert!(client.load().is_ok());
    }

    #[test]
    fn test_token_header_requires_authentication() {
        let client = HttpClient::new(&config(json!({"address": "localhost"})), "", false).unwrap();
        assert!(matches!(
            client.token_header(),
            Err(DakaraError::NotAuthenticated(_))
        ));

        let client =
            HttpClient::new(&config(json!({"address": "localhost", "token": "abc"})), "", false)
                .unwrap();
        let headers = client.token_header().unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Token abc");
    }

    #[test]
    fn test_authentication_error_messages() {
        let error = authentication_error(StatusCode::BAD_REQUEST, "");
        assert!(error.to_string().contains("Login to server failed"));

        let error = authentication_error(StatusCode::INTERNAL_SERVER_ERROR, &"x".repeat(500));
        let message = error.to_string();
        assert!(message.contains("500"));
        assert!(message.len() < 300);
    }

    #[tokio::test]
    async fn test_unsupported_method() {
        let client =
            HttpClient::new(&config(json!({"address": "localhost", "token": "abc"})), "", false)
                .unwrap();
        assert!(matches!(
            client.request("teleport", "songs/", None).await,
            Err(DakaraError::MethodError(_))
        ));
    }
}
