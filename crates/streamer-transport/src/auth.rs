//! RTMP publish authentication.
//!
//! Servers that want credentials refuse `connect` and name their scheme in
//! the error description. The client reconnects with the answer appended
//! to the application name:
//!
//! 1. `app?authmod=adobe&user=alice`, answered with
//!    `... authmod=adobe ?reason=needauth&user=alice&salt=..&challenge=..&opaque=..`
//! 2. `app?authmod=adobe&user=alice&challenge=<ours>&response=<digest>&opaque=..`
//!
//! Limelight (`llnw`) follows the same two steps with an HTTP-digest style
//! response over a server nonce.

use std::collections::HashMap;

use base64::engine::{general_purpose, Engine};

use crate::config::{RtmpAuthMode, RtmpConfig};

/// Realm Limelight servers hash credentials with.
const LLNW_REALM: &str = "live";

/// Nonce count; every answer is the first use of the server nonce.
const LLNW_NONCE_COUNT: &str = "00000001";

/// Challenge/response scheme spoken by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthScheme {
    Adobe,
    Llnw,
}

impl AuthScheme {
    /// Scheme a mode asks for before the server says anything.
    fn for_mode(mode: RtmpAuthMode) -> Option<Self> {
        match mode {
            RtmpAuthMode::Default => None,
            RtmpAuthMode::Llnw => Some(Self::Llnw),
            RtmpAuthMode::Rtmp | RtmpAuthMode::Akamai | RtmpAuthMode::Periscope => Some(Self::Adobe),
        }
    }

    fn from_description(description: &str) -> Option<Self> {
        if description.contains("authmod=adobe") {
            Some(Self::Adobe)
        } else if description.contains("authmod=llnw") {
            Some(Self::Llnw)
        } else {
            None
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Adobe => "adobe",
            Self::Llnw => "llnw",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Nothing sent beyond what the first `connect` carried.
    Initial,
    /// The user name was announced and the server should now challenge.
    UserSent,
    /// A response was sent; any further refusal is final.
    Answered,
}

/// Drives the reconnect steps of one publish attempt.
#[derive(Debug)]
pub(crate) struct Authenticator {
    app: String,
    credentials: Option<(String, String)>,
    scheme: Option<AuthScheme>,
    stage: Stage,
}

impl Authenticator {
    pub fn new(config: &RtmpConfig) -> Self {
        let credentials = config
            .credentials()
            .map(|(user, pass)| (user.to_string(), pass.to_string()));
        let scheme = AuthScheme::for_mode(config.auth_mode());
        let stage = match (scheme, &credentials) {
            (Some(_), Some(_)) => Stage::UserSent,
            _ => Stage::Initial,
        };
        Self {
            app: config.app_name().to_string(),
            credentials,
            scheme,
            stage,
        }
    }

    /// Application name for the first `connect`.
    pub fn initial_app(&self) -> String {
        match (self.scheme, &self.credentials) {
            (Some(scheme), Some((user, _))) => self.announce(scheme, user),
            _ => self.app.clone(),
        }
    }

    /// React to a refused `connect`.
    ///
    /// Returns the application name to reconnect with, or the reason to
    /// give up with.
    pub fn on_rejected(&mut self, description: &str) -> Result<String, String> {
        let Some((user, password)) = self.credentials.clone() else {
            return Err(description.to_string());
        };
        if description.contains("reason=authfailed") || description.contains("reason=nosuchuser") {
            return Err(description.to_string());
        }
        if self.stage == Stage::Answered {
            return Err(description.to_string());
        }

        let scheme = AuthScheme::from_description(description)
            .or(self.scheme)
            .ok_or_else(|| description.to_string())?;
        self.scheme = Some(scheme);

        let Some(params) = needauth_params(description) else {
            if self.stage == Stage::UserSent {
                return Err(description.to_string());
            }
            self.stage = Stage::UserSent;
            return Ok(self.announce(scheme, &user));
        };

        self.stage = Stage::Answered;
        let client_nonce = format!("{:08x}", rand::random::<u32>());
        let query = match scheme {
            AuthScheme::Adobe => {
                let salt = params
                    .get("salt")
                    .ok_or_else(|| format!("challenge without salt: {}", description))?;
                let challenge = params.get("challenge").map(String::as_str);
                let opaque = params.get("opaque").map(String::as_str);
                let response = adobe_response(&user, &password, salt, challenge, opaque, &client_nonce);

                let mut query = format!(
                    "?authmod=adobe&user={}&challenge={}&response={}",
                    user, client_nonce, response
                );
                if let Some(opaque) = opaque {
                    query.push_str(&format!("&opaque={}", opaque));
                }
                query
            }
            AuthScheme::Llnw => {
                let nonce = params
                    .get("nonce")
                    .ok_or_else(|| format!("challenge without nonce: {}", description))?;
                let response = llnw_response(&user, &password, &self.app, nonce, &client_nonce);
                format!(
                    "?authmod=llnw&user={}&nonce={}&cnonce={}&nc={}&response={}",
                    user, nonce, client_nonce, LLNW_NONCE_COUNT, response
                )
            }
        };
        Ok(format!("{}{}", self.app, query))
    }

    fn announce(&self, scheme: AuthScheme, user: &str) -> String {
        format!("{}?authmod={}&user={}", self.app, scheme.name(), user)
    }
}

/// Key/value pairs following `?reason=needauth` in a rejection.
fn needauth_params(description: &str) -> Option<HashMap<String, String>> {
    let start = description.find("?reason=needauth")?;
    let params = description[start + 1..]
        .split(|c: char| c == '&' || c.is_whitespace())
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    Some(params)
}

fn base64_md5(input: &[u8]) -> String {
    general_purpose::STANDARD.encode(md5::compute(input).0)
}

/// Adobe response: `b64(md5(b64(md5(user salt password)) (opaque|challenge) ours))`.
pub(crate) fn adobe_response(
    user: &str,
    password: &str,
    salt: &str,
    challenge: Option<&str>,
    opaque: Option<&str>,
    client_challenge: &str,
) -> String {
    let hash = base64_md5(format!("{}{}{}", user, salt, password).as_bytes());
    let server_part = opaque.or(challenge).unwrap_or_default();
    base64_md5(format!("{}{}{}", hash, server_part, client_challenge).as_bytes())
}

/// Limelight response, an HTTP digest with `qop=auth` over the publish path.
pub(crate) fn llnw_response(user: &str, password: &str, app: &str, nonce: &str, cnonce: &str) -> String {
    let ha1 = md5::compute(format!("{}:{}:{}", user, LLNW_REALM, password));
    let path = if app.contains('/') {
        app.to_string()
    } else {
        format!("{}/_definst_", app)
    };
    let ha2 = md5::compute(format!("publish:/{}", path));
    let digest = md5::compute(format!(
        "{:x}:{}:{}:{}:auth:{:x}",
        ha1, nonce, LLNW_NONCE_COUNT, cnonce, ha2
    ));
    format!("{:x}", digest)
}
