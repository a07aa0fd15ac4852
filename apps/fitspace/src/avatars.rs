use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::auth::{AuthError, AuthInfo};

/// Typed client for the avatar configuration endpoints. All routes are
/// scoped to the authenticated user; the backend enforces a five-avatar
/// quota and unique names per user.
pub struct AvatarClient {
    client: reqwest::Client,
    base_url: Url,
    identity: AuthInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Female,
    Male,
    NonBinary,
    Unspecified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreationMode {
    Manual,
    Scan,
    Preset,
    Import,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Web,
    Ios,
    Android,
    Kiosk,
    Api,
    Integration,
}

/// One morph slider. `slider_value` is the UI-range value; `unreal_value`
/// is the engine-range value derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MorphTarget {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slider_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unreal_value: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickModeSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_shape: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub athletic_level: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub measurements: BTreeMap<String, f64>,
}

/// Request payload for create and update.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvatarDraft {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
    /// Free-form label; the backend accepts both life-stage names and
    /// decade ranges like "20-29".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_range: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_mode: Option<CreationMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quick_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by_session: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub basic_measurements: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub body_measurements: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub morph_targets: Vec<MorphTarget>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quick_mode_settings: Option<QuickModeSettings>,
}

/// A stored avatar as the backend returns it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Avatar {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub age_range: Option<String>,
    #[serde(default)]
    pub creation_mode: Option<CreationMode>,
    #[serde(default)]
    pub source: Option<Source>,
    #[serde(default)]
    pub quick_mode: bool,
    #[serde(default)]
    pub created_by_session: Option<String>,
    #[serde(default)]
    pub basic_measurements: BTreeMap<String, f64>,
    #[serde(default)]
    pub body_measurements: BTreeMap<String, f64>,
    #[serde(default)]
    pub morph_targets: Vec<MorphTarget>,
    #[serde(default)]
    pub quick_mode_settings: Option<QuickModeSettings>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvatarList {
    pub user_id: String,
    pub limit: usize,
    pub count: usize,
    pub total: usize,
    pub items: Vec<Avatar>,
}

#[derive(Error, Debug)]
pub enum AvatarError {
    #[error("authentication required: {0}")]
    Auth(#[from] AuthError),
    #[error("avatar not found")]
    NotFound,
    #[error("avatar quota exceeded")]
    QuotaExceeded,
    #[error("an avatar with that name already exists")]
    DuplicateName,
    #[error("invalid avatar payload: {0}")]
    Invalid(String),
    #[error("unexpected http status {status}: {message}")]
    Http { status: StatusCode, message: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("invalid avatar endpoint: {0}")]
    InvalidConfig(String),
}

/// Error body the backend attaches to non-2xx responses.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// Pure status-to-error translation. 409 is overloaded by the backend for
/// both the quota and the duplicate-name case; the message disambiguates.
pub(crate) fn map_failure(status: StatusCode, message: &str) -> AvatarError {
    match status {
        StatusCode::NOT_FOUND => AvatarError::NotFound,
        StatusCode::CONFLICT => {
            if message.to_ascii_lowercase().contains("maximum") {
                AvatarError::QuotaExceeded
            } else {
                AvatarError::DuplicateName
            }
        }
        StatusCode::BAD_REQUEST => AvatarError::Invalid(message.to_string()),
        other => AvatarError::Http {
            status: other,
            message: message.to_string(),
        },
    }
}

impl AvatarClient {
    /// `base_url` must end with the API prefix, e.g. `https://host/api/`.
    pub fn new(base_url: Url, identity: AuthInfo) -> Result<Self, AvatarError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(10))
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            base_url,
            identity,
        })
    }

    pub async fn list(&self) -> Result<AvatarList, AvatarError> {
        let url = self.collection_url()?;
        let response = self.request(Method::GET, url).send().await?;
        Ok(self.check(response).await?.json().await?)
    }

    pub async fn create(&self, draft: &AvatarDraft) -> Result<Avatar, AvatarError> {
        let url = self.collection_url()?;
        let response = self.request(Method::POST, url).json(draft).send().await?;
        Ok(self.check(response).await?.json().await?)
    }

    pub async fn get(&self, avatar_id: &str) -> Result<Avatar, AvatarError> {
        let url = self.item_url(avatar_id)?;
        let response = self.request(Method::GET, url).send().await?;
        Ok(self.check(response).await?.json().await?)
    }

    pub async fn update(&self, avatar_id: &str, draft: &AvatarDraft) -> Result<Avatar, AvatarError> {
        let url = self.item_url(avatar_id)?;
        let response = self.request(Method::PUT, url).json(draft).send().await?;
        Ok(self.check(response).await?.json().await?)
    }

    pub async fn delete(&self, avatar_id: &str) -> Result<(), AvatarError> {
        let url = self.item_url(avatar_id)?;
        let response = self.request(Method::DELETE, url).send().await?;
        self.check(response).await?;
        Ok(())
    }

    fn collection_url(&self) -> Result<Url, AvatarError> {
        let (user_id, _) = self.identity.require_authenticated()?;
        self.base_url
            .join(&format!("users/{user_id}/avatars"))
            .map_err(|err| AvatarError::InvalidConfig(err.to_string()))
    }

    fn item_url(&self, avatar_id: &str) -> Result<Url, AvatarError> {
        let (user_id, _) = self.identity.require_authenticated()?;
        self.base_url
            .join(&format!("users/{user_id}/avatars/{avatar_id}"))
            .map_err(|err| AvatarError::InvalidConfig(err.to_string()))
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(session_id) = &self.identity.session_id {
            builder = builder.header("X-Session-Id", session_id);
        }
        if let Some(email) = &self.identity.email {
            builder = builder.header("X-User-Email", email);
        }
        builder
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, AvatarError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .json::<ErrorBody>()
            .await
            .map(|body| body.message)
            .unwrap_or_default();
        Err(map_failure(status, &message))
    }
}
