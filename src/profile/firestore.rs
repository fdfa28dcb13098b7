//! Firestore REST profile store.
//!
//! DESIGN
//! ======
//! Firestore wraps every value in a typed envelope (`{"booleanValue": true}`),
//! so documents go through a small JSON codec on the way in and out. Writes
//! use `PATCH` without an update mask, which replaces the whole document
//! (set semantics). Requests carry the identity provider's current id token
//! when a user is signed in.

use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::debug;

use super::{ProfileError, ProfileStore};
use crate::config::{ConfigError, HttpTimeouts, env_or, require_env};
use crate::identity::IdentityProvider;
use crate::record::ProfileDocument;

pub const DEFAULT_FIRESTORE_BASE_URL: &str = "https://firestore.googleapis.com/v1";

// =============================================================================
// CONFIG
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirestoreConfig {
    pub project_id: String,
    pub base_url: String,
    pub timeouts: HttpTimeouts,
}

impl FirestoreConfig {
    /// Required: `PROFILE_PROJECT_ID`. Optional: `PROFILE_BASE_URL`.
    ///
    /// # Errors
    ///
    /// Returns an error if the project id is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            project_id: require_env("PROFILE_PROJECT_ID")?,
            base_url: env_or("PROFILE_BASE_URL", DEFAULT_FIRESTORE_BASE_URL),
            timeouts: HttpTimeouts::from_env(),
        })
    }

    fn documents_root(&self) -> String {
        format!("{}/projects/{}/databases/(default)/documents", self.base_url, self.project_id)
    }
}

// =============================================================================
// CLIENT
// =============================================================================

pub struct FirestoreProfileStore {
    http: reqwest::Client,
    config: FirestoreConfig,
    identity: Arc<dyn IdentityProvider>,
}

impl FirestoreProfileStore {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: FirestoreConfig, identity: Arc<dyn IdentityProvider>) -> Result<Self, ProfileError> {
        let http = config
            .timeouts
            .client()
            .map_err(|e| ProfileError::Request(format!("http client build failed: {e}")))?;
        Ok(Self { http, config, identity })
    }

    fn document_url(&self, collection: &str, id: &str) -> String {
        format!("{}/{collection}/{id}", self.config.documents_root())
    }

    async fn bearer(&self) -> Option<String> {
        let user = self.identity.current_user()?;
        match self.identity.get_id_token(&user).await {
            Ok(token) => Some(token),
            Err(e) => {
                debug!(error = %e, "profile request without bearer token");
                None
            }
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<(u16, String), ProfileError> {
        let request = match self.bearer().await {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request
            .send()
            .await
            .map_err(|e| ProfileError::Request(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ProfileError::Request(e.to_string()))?;
        Ok((status, body))
    }
}

#[async_trait::async_trait]
impl ProfileStore for FirestoreProfileStore {
    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<ProfileDocument>, ProfileError> {
        let (status, body) = self
            .send(self.http.get(self.document_url(collection, id)))
            .await?;
        match status {
            404 => Ok(None),
            200..=299 => {
                let raw: Value = serde_json::from_str(&body).map_err(|e| ProfileError::Decode(e.to_string()))?;
                decode_document(&raw).map(Some)
            }
            _ => Err(ProfileError::Status { status, body }),
        }
    }

    async fn set_document(&self, collection: &str, id: &str, doc: &ProfileDocument) -> Result<(), ProfileError> {
        let body = encode_document(doc)?;
        let (status, text) = self
            .send(self.http.patch(self.document_url(collection, id)).json(&body))
            .await?;
        if (200..300).contains(&status) {
            Ok(())
        } else {
            Err(ProfileError::Status { status, body: text })
        }
    }

    async fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<ProfileDocument>, ProfileError> {
        let url = format!("{}:runQuery", self.config.documents_root());
        let query = build_field_query(collection, field, value);
        let (status, body) = self.send(self.http.post(url).json(&query)).await?;
        if !(200..300).contains(&status) {
            return Err(ProfileError::Status { status, body });
        }
        let rows: Vec<Value> = serde_json::from_str(&body).map_err(|e| ProfileError::Decode(e.to_string()))?;
        rows.iter()
            .find_map(|row| row.get("document"))
            .map(decode_document)
            .transpose()
    }
}

// =============================================================================
// CODEC
// =============================================================================

pub(crate) fn build_field_query(collection: &str, field: &str, value: &str) -> Value {
    json!({
        "structuredQuery": {
            "from": [{ "collectionId": collection }],
            "where": {
                "fieldFilter": {
                    "field": { "fieldPath": field },
                    "op": "EQUAL",
                    "value": { "stringValue": value },
                }
            },
            "limit": 1,
        }
    })
}

pub(crate) fn encode_document(doc: &ProfileDocument) -> Result<Value, ProfileError> {
    let Value::Object(map) = serde_json::to_value(doc).map_err(|e| ProfileError::Decode(e.to_string()))? else {
        return Err(ProfileError::Decode("profile document is not an object".into()));
    };
    Ok(json!({ "fields": encode_fields(&map) }))
}

pub(crate) fn decode_document(raw: &Value) -> Result<ProfileDocument, ProfileError> {
    let fields = match raw.get("fields") {
        Some(Value::Object(fields)) => decode_fields(fields)?,
        Some(_) => return Err(ProfileError::Decode("`fields` is not an object".into())),
        None => Map::new(),
    };
    serde_json::from_value(Value::Object(fields)).map_err(|e| ProfileError::Decode(e.to_string()))
}

pub(crate) fn encode_fields(map: &Map<String, Value>) -> Value {
    Value::Object(map.iter().map(|(k, v)| (k.clone(), encode_value(v))).collect())
}

pub(crate) fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                json!({ "integerValue": i.to_string() })
            } else if let Some(u) = n.as_u64() {
                json!({ "integerValue": u.to_string() })
            } else {
                json!({ "doubleValue": n.as_f64().unwrap_or_default() })
            }
        }
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => json!({ "arrayValue": { "values": items.iter().map(encode_value).collect::<Vec<_>>() } }),
        Value::Object(map) => json!({ "mapValue": { "fields": encode_fields(map) } }),
    }
}

pub(crate) fn decode_fields(fields: &Map<String, Value>) -> Result<Map<String, Value>, ProfileError> {
    fields
        .iter()
        .map(|(k, v)| decode_value(v).map(|decoded| (k.clone(), decoded)))
        .collect()
}

pub(crate) fn decode_value(value: &Value) -> Result<Value, ProfileError> {
    let Some((kind, inner)) = value.as_object().and_then(|o| o.iter().next()) else {
        return Err(ProfileError::Decode(format!("untyped value: {value}")));
    };
    match kind.as_str() {
        "nullValue" => Ok(Value::Null),
        "booleanValue" => inner
            .as_bool()
            .map(Value::Bool)
            .ok_or_else(|| ProfileError::Decode(format!("bad booleanValue: {inner}"))),
        "integerValue" => {
            let parsed = match inner {
                Value::String(s) => s.parse::<i64>().ok(),
                other => other.as_i64(),
            };
            parsed
                .map(Value::from)
                .ok_or_else(|| ProfileError::Decode(format!("bad integerValue: {inner}")))
        }
        "doubleValue" => inner
            .as_f64()
            .map(Value::from)
            .ok_or_else(|| ProfileError::Decode(format!("bad doubleValue: {inner}"))),
        "stringValue" | "timestampValue" | "referenceValue" | "bytesValue" => inner
            .as_str()
            .map(|s| Value::String(s.to_owned()))
            .ok_or_else(|| ProfileError::Decode(format!("bad {kind}: {inner}"))),
        "geoPointValue" => Ok(inner.clone()),
        "arrayValue" => match inner.get("values") {
            Some(Value::Array(items)) => items.iter().map(decode_value).collect::<Result<Vec<_>, _>>().map(Value::Array),
            _ => Ok(Value::Array(Vec::new())),
        },
        "mapValue" => match inner.get("fields") {
            Some(Value::Object(fields)) => decode_fields(fields).map(Value::Object),
            _ => Ok(Value::Object(Map::new())),
        },
        other => Err(ProfileError::Decode(format!("unsupported value type: {other}"))),
    }
}

#[cfg(test)]
#[path = "firestore_test.rs"]
mod tests;
