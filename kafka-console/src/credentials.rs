//! Injects caller supplied credentials into the properties of a cluster whose SASL login is not configured.
//!
//! Credentials are taken from the raw value of an inbound `Authorization` header:
//! * `OAUTHBEARER` uses a `Bearer` token verbatim.
//! * `PLAIN`, `SCRAM-SHA-256` and `SCRAM-SHA-512` use a `Basic` username/password pair.

use crate::properties::{
    self, PropertyMap, SASL_JAAS_CONFIG, SASL_LOGIN_CALLBACK_HANDLER_CLASS,
    SASL_LOGIN_REFRESH_BUFFER_SECONDS,
};
use base64::{Engine, engine::general_purpose};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const OAUTHBEARER: &str = "OAUTHBEARER";
pub const PLAIN: &str = "PLAIN";
pub const SCRAM_SHA256: &str = "SCRAM-SHA-256";
pub const SCRAM_SHA512: &str = "SCRAM-SHA-512";

pub const OAUTH_LOGIN_CALLBACK_HANDLER: &str =
    "io.strimzi.kafka.oauth.client.JaasClientOauthLoginCallbackHandler";

const OAUTH_LOGIN_MODULE: &str =
    "org.apache.kafka.common.security.oauthbearer.OAuthBearerLoginModule";
const PLAIN_LOGIN_MODULE: &str = "org.apache.kafka.common.security.plain.PlainLoginModule";
const SCRAM_LOGIN_MODULE: &str = "org.apache.kafka.common.security.scram.ScramLoginModule";

const BEARER: &str = "Bearer";
const BASIC: &str = "Basic";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("SASL mechanism {0} is not supported for caller supplied credentials")]
    UnsupportedMechanism(String),
    #[error("{scheme} credentials are required to access this cluster")]
    MissingCredentials { scheme: &'static str },
    #[error("Basic credentials could not be decoded")]
    MalformedBasic,
    #[error("Basic credentials must include a non-empty username and password")]
    EmptyCredentials,
}

impl AuthFailure {
    /// The authentication scheme the caller should be challenged with.
    pub fn challenge(&self) -> &'static str {
        match self {
            AuthFailure::MissingCredentials { scheme } => scheme,
            // an unsupported mechanism has no satisfying scheme, challenge with the most common one
            AuthFailure::UnsupportedMechanism(_) => BEARER,
            AuthFailure::MalformedBasic | AuthFailure::EmptyCredentials => BASIC,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    OAuthBearer,
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::OAuthBearer => OAUTHBEARER,
            SaslMechanism::Plain => PLAIN,
            SaslMechanism::ScramSha256 => SCRAM_SHA256,
            SaslMechanism::ScramSha512 => SCRAM_SHA512,
        }
    }

    /// The `Authorization` scheme a caller uses to supply credentials for this mechanism.
    fn scheme(&self) -> &'static str {
        match self {
            SaslMechanism::OAuthBearer => BEARER,
            SaslMechanism::Plain | SaslMechanism::ScramSha256 | SaslMechanism::ScramSha512 => BASIC,
        }
    }
}

impl FromStr for SaslMechanism {
    type Err = AuthFailure;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            OAUTHBEARER => Ok(SaslMechanism::OAuthBearer),
            PLAIN => Ok(SaslMechanism::Plain),
            SCRAM_SHA256 => Ok(SaslMechanism::ScramSha256),
            SCRAM_SHA512 => Ok(SaslMechanism::ScramSha512),
            other => Err(AuthFailure::UnsupportedMechanism(other.to_owned())),
        }
    }
}

impl fmt::Display for SaslMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A credential extracted from an `Authorization` header.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Bearer(String),
    Basic { username: String, password: String },
}

// Never print secrets
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Bearer(_) => f.write_str("Bearer(******)"),
            Credential::Basic { username, .. } => {
                write!(f, "Basic {{ username: {username:?}, password: ****** }}")
            }
        }
    }
}

impl Credential {
    /// Extracts the credential a mechanism needs from the raw `Authorization` header value.
    pub fn from_authorization(
        mechanism: SaslMechanism,
        authorization: Option<&str>,
    ) -> Result<Credential, AuthFailure> {
        let scheme = mechanism.scheme();
        let payload = authorization
            .and_then(|header| strip_scheme(header, scheme))
            .ok_or(AuthFailure::MissingCredentials { scheme })?;

        match mechanism {
            SaslMechanism::OAuthBearer => {
                if payload.is_empty() {
                    Err(AuthFailure::MissingCredentials { scheme })
                } else {
                    Ok(Credential::Bearer(payload.to_owned()))
                }
            }
            SaslMechanism::Plain | SaslMechanism::ScramSha256 | SaslMechanism::ScramSha512 => {
                decode_basic(payload)
            }
        }
    }
}

/// Case insensitive match of `<scheme> ` at the start of the header, returning the remainder.
fn strip_scheme<'a>(header: &'a str, scheme: &str) -> Option<&'a str> {
    let prefix_len = scheme.len() + 1;
    if header.len() < prefix_len || !header.is_char_boundary(prefix_len) {
        return None;
    }
    let (prefix, payload) = header.split_at(prefix_len);
    if prefix[..scheme.len()].eq_ignore_ascii_case(scheme) && prefix.ends_with(' ') {
        Some(payload)
    } else {
        None
    }
}

fn decode_basic(payload: &str) -> Result<Credential, AuthFailure> {
    let decoded = general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|_| AuthFailure::MalformedBasic)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthFailure::MalformedBasic)?;
    let (username, password) = decoded.split_once(':').ok_or(AuthFailure::MalformedBasic)?;
    if username.is_empty() || password.is_empty() {
        return Err(AuthFailure::EmptyCredentials);
    }
    Ok(Credential::Basic {
        username: username.to_owned(),
        password: password.to_owned(),
    })
}

/// Quotes a value for embedding within a login module configuration string.
fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Returns a copy of `properties` authenticated with the caller supplied credential for `mechanism`.
pub fn inject(
    properties: &PropertyMap,
    mechanism: &str,
    authorization: Option<&str>,
) -> Result<PropertyMap, AuthFailure> {
    let mechanism: SaslMechanism = mechanism.parse()?;
    let credential = Credential::from_authorization(mechanism, authorization)?;
    let mut properties = properties.clone();

    let jaas_config = match (mechanism, credential) {
        (SaslMechanism::OAuthBearer, Credential::Bearer(token)) => {
            tracing::trace!("SASL/OAUTHBEARER enabled");
            properties
                .entry(SASL_LOGIN_CALLBACK_HANDLER_CLASS.to_owned())
                .or_insert_with(|| OAUTH_LOGIN_CALLBACK_HANDLER.to_owned());
            // Do not attempt token refresh ahead of expiration, the token belongs to the caller
            properties
                .entry(SASL_LOGIN_REFRESH_BUFFER_SECONDS.to_owned())
                .or_insert_with(|| "0".to_owned());
            format!(
                "{OAUTH_LOGIN_MODULE} required oauth.access.token={} ;",
                quote(&token)
            )
        }
        (mechanism, Credential::Basic { username, password }) => {
            tracing::trace!("SASL/{mechanism} enabled");
            let module = match mechanism {
                SaslMechanism::Plain => PLAIN_LOGIN_MODULE,
                _ => SCRAM_LOGIN_MODULE,
            };
            format!(
                "{module} required username={} password={} ;",
                quote(&username),
                quote(&password)
            )
        }
        (mechanism, Credential::Bearer(_)) => {
            // from_authorization only produces bearer credentials for OAUTHBEARER
            return Err(AuthFailure::MissingCredentials {
                scheme: mechanism.scheme(),
            });
        }
    };

    properties.insert(SASL_JAAS_CONFIG.to_owned(), jaas_config);
    Ok(properties)
}

/// Authenticates `properties` with the caller's credential only when the cluster requires it,
/// otherwise returns the properties unchanged.
pub fn authenticate(
    properties: &PropertyMap,
    authorization: Option<&str>,
) -> Result<PropertyMap, AuthFailure> {
    match properties::sasl_mechanism(properties) {
        Some(mechanism) if properties::requires_authentication(properties) => {
            inject(properties, mechanism, authorization)
        }
        _ => Ok(properties.clone()),
    }
}
