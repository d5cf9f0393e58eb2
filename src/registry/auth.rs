use reqwest::Client;

use crate::config::HUB_LOGIN_URL;
use crate::error::{ImageCycleError, Result};

/// Parsed `WWW-Authenticate: Bearer …` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

/// Parse a bearer challenge header into realm/service/scope.
/// Example: `Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:owner/name:delete"`
pub fn parse_bearer_challenge(www_auth: &str) -> Option<BearerChallenge> {
    let auth_str = www_auth.strip_prefix("Bearer ")?;

    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for part in auth_str.split(',') {
        let part = part.trim();
        if let Some(v) = unquote(part, "realm=") {
            realm = Some(v);
        } else if let Some(v) = unquote(part, "service=") {
            service = Some(v);
        } else if let Some(v) = unquote(part, "scope=") {
            scope = Some(v);
        }
    }

    Some(BearerChallenge {
        realm: realm?,
        service,
        scope,
    })
}

fn unquote(part: &str, key: &str) -> Option<String> {
    part.strip_prefix(key)
        .map(|s| s.trim_matches('"').to_string())
}

/// Exchange a bearer challenge (plus optional basic credentials) for a
/// short-lived token at the realm endpoint.
pub async fn exchange_token(
    http: &Client,
    challenge: &BearerChallenge,
    credentials: Option<(&str, &str)>,
) -> Result<String> {
    let mut params: Vec<(&str, &str)> = Vec::new();
    if let Some(service) = &challenge.service {
        params.push(("service", service));
    }
    if let Some(scope) = &challenge.scope {
        params.push(("scope", scope));
    }

    let mut request = http
        .get(&challenge.realm)
        .query(&params)
        .header("Accept", "application/json");
    if let Some((user, password)) = credentials {
        request = request.basic_auth(user, Some(password));
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ImageCycleError::AuthChallenge(format!(
            "{} returned HTTP {}",
            challenge.realm, status
        )));
    }

    let json: serde_json::Value = response
        .json()
        .await
        .map_err(|e| ImageCycleError::AuthChallenge(format!("bad token response: {}", e)))?;

    // Most registries call the field "token"; some use "access_token".
    json.get("token")
        .and_then(|t| t.as_str())
        .or_else(|| json.get("access_token").and_then(|t| t.as_str()))
        .map(|t| t.to_string())
        .ok_or_else(|| {
            ImageCycleError::AuthChallenge(format!("no token in response from {}", challenge.realm))
        })
}

/// The public hub's username/password login, yielding the session token its
/// tag-delete endpoint wants. Not part of the distribution API.
pub async fn hub_session_token(http: &Client, username: &str, password: &str) -> Result<String> {
    let response = http
        .post(HUB_LOGIN_URL)
        .header("Content-Type", "application/json")
        .header("Accept", "application/json")
        .json(&serde_json::json!({
            "username": username,
            "password": password,
        }))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(ImageCycleError::AuthChallenge(format!(
            "hub login returned HTTP {}",
            status
        )));
    }

    let json: serde_json::Value = response
        .json()
        .await
        .map_err(|e| ImageCycleError::AuthChallenge(format!("bad login response: {}", e)))?;

    json.get("token")
        .and_then(|t| t.as_str())
        .map(|t| t.to_string())
        .ok_or_else(|| ImageCycleError::AuthChallenge("hub login returned no token".to_string()))
}
