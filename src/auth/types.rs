// Authentication types

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TokenError;

/// Token scheme used when the server omits `token_type`
const DEFAULT_TOKEN_TYPE: &str = "Bearer";

/// Persisted credential state
///
/// Mirrors the token endpoint response, extended with the request-initiation
/// timestamp. `expires_in` and `time` are milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenState {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_type: Option<String>,
    pub expires_in: Option<i64>,
    pub scope: Option<String>,
    pub time: Option<i64>,

    /// Additional response fields (e.g. `id_token`), persisted as-is
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TokenState {
    /// Build a state from a raw token endpoint payload
    ///
    /// `time` must be captured before the request was sent so that network
    /// latency never extends the effective lifetime.
    pub fn from_response(payload: &Value, time: i64) -> Result<Self, TokenError> {
        let Value::Object(fields) = payload else {
            return Err(TokenError::InvalidResponse(format!(
                "expected a JSON object, got {}",
                value_kind(payload)
            )));
        };

        let mut extra = fields.clone();
        let expires_in = extra
            .remove("expires_in")
            .as_ref()
            .and_then(normalize_expires_in);
        // Server-provided timestamps are never trusted
        extra.remove("time");

        Ok(Self {
            access_token: take_string(&mut extra, "access_token"),
            refresh_token: take_string(&mut extra, "refresh_token"),
            token_type: take_string(&mut extra, "token_type"),
            expires_in,
            scope: take_string(&mut extra, "scope"),
            time: Some(time),
            extra,
        })
    }

    /// Absolute expiry instant (epoch ms), if both `time` and `expires_in` are known
    pub fn expires_at(&self) -> Option<i64> {
        Some(self.time?.saturating_add(self.expires_in?))
    }

    /// Validity predicate: `time + expires_in > now`
    pub fn is_authenticated_at(&self, now: i64) -> bool {
        self.expires_at().is_some_and(|exp| exp > now)
    }

    /// Remaining lifetime in ms, never negative
    pub fn expires_in_at(&self, now: i64) -> i64 {
        match self.expires_at() {
            Some(exp) if exp > now => exp - now,
            _ => 0,
        }
    }

    /// Authorization header for this state, if it is valid at `now`
    pub fn authorization_header_at(&self, now: i64) -> Option<AuthorizationHeader> {
        if !self.is_authenticated_at(now) {
            return None;
        }
        let access_token = self.access_token.as_deref()?;
        let scheme = self
            .token_type
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(normalize_token_type)
            .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_string());

        Some(AuthorizationHeader {
            authorization: format!("{} {}", scheme, access_token),
        })
    }
}

/// Convert a raw `expires_in` (seconds, number or numeric string) to milliseconds
///
/// Parsing is lenient like a leading-integer parse: `"3600"`, `3600`, `"3600.9"`
/// and `"3600s"` all yield 3_600_000. Negative values clamp to 0. Anything
/// without a leading integer yields `None`.
pub fn normalize_expires_in(raw: &Value) -> Option<i64> {
    let seconds = match raw {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))?,
        Value::String(s) => parse_leading_integer(s)?,
        _ => return None,
    };

    Some(seconds.max(0).saturating_mul(1000))
}

/// Parse an optional sign followed by ASCII digits, ignoring any trailing text
fn parse_leading_integer(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }

    // Overflowing digit runs saturate instead of failing
    let magnitude = digits[..end].parse::<i64>().unwrap_or(i64::MAX);
    Some(if negative { -magnitude } else { magnitude })
}

/// Capitalize a token type for use in a header (`bearer` -> `Bearer`)
pub fn normalize_token_type(token_type: &str) -> String {
    let mut chars = token_type.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Preview of a secret for log output (first 8 chars)
pub fn token_preview(token: &str) -> String {
    if token.chars().count() > 12 {
        format!("{}...", token.chars().take(8).collect::<String>())
    } else {
        "***".to_string()
    }
}

fn take_string(fields: &mut Map<String, Value>, key: &str) -> Option<String> {
    match fields.remove(key)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Authorization header produced for outbound requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizationHeader {
    pub authorization: String,
}

impl AuthorizationHeader {
    /// Header name
    pub const NAME: &'static str = "authorization";
}

/// OAuth2 grant used for a token request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    AuthorizationCode,
    RefreshToken,
}

impl Grant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Grant::AuthorizationCode => "authorization_code",
            Grant::RefreshToken => "refresh_token",
        }
    }
}

/// Expected body format of an authorization server response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Json,
    /// Revocation endpoints frequently answer with an empty or non-JSON body
    Text,
}

/// Request handed to the transport
#[derive(Debug, Clone, PartialEq)]
pub struct AuthRequest {
    pub url: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    /// Form-encoded body parameters
    pub body: Vec<(String, String)>,
    pub response_format: ResponseFormat,
}

impl AuthRequest {
    /// Token request for the given grant
    pub fn grant(url: &str, grant: Grant, params: Vec<(&str, Option<String>)>) -> Self {
        let mut body = vec![("grant_type".to_string(), grant.as_str().to_string())];
        body.extend(form_params(params));

        Self {
            url: url.to_string(),
            method: Method::POST,
            headers: Vec::new(),
            body,
            response_format: ResponseFormat::Json,
        }
    }

    /// Revocation request for an access token
    pub fn revocation(url: &str, access_token: &str, header: &AuthorizationHeader) -> Self {
        Self {
            url: url.to_string(),
            method: Method::POST,
            headers: Vec::new(),
            body: vec![
                ("token".to_string(), access_token.to_string()),
                ("token_type_hint".to_string(), "access_token".to_string()),
            ],
            response_format: ResponseFormat::Text,
        }
        .with_authorization(header)
    }

    pub fn with_authorization(mut self, header: &AuthorizationHeader) -> Self {
        self.headers.push((
            AuthorizationHeader::NAME.to_string(),
            header.authorization.clone(),
        ));
        self
    }

    /// Look up a body parameter
    pub fn param(&self, key: &str) -> Option<&str> {
        self.body
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Absent parameters are omitted from the form body
fn form_params(params: Vec<(&str, Option<String>)>) -> impl Iterator<Item = (String, String)> + '_ {
    params
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k.to_string(), v)))
}
