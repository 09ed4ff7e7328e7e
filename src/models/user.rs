use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Profile of the signed-in console user, as returned by `GET /auth/me`.
///
/// The backend owns this shape. Only `id` is required; every other field is
/// optional and anything we don't model is kept in `extra` so the profile we
/// store and republish is the one the server sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(
        rename = "twoFactorEnabled",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub two_factor_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserProfile {
    /// Whether the account has a second factor configured
    pub fn has_two_factor(&self) -> bool {
        self.two_factor_enabled.unwrap_or(false)
    }

    /// Best label for display: name, then email, then the id
    pub fn display_name(&self) -> String {
        self.name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .or(self.email.as_deref())
            .map(str::to_string)
            .unwrap_or_else(|| match &self.id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
    }
}
