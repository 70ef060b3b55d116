use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Claims carried by the bearer tokens the external auth module issues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    pub exp: u64,
    pub email: Option<String>,
    pub role: Option<String>,
    pub user_metadata: Option<serde_json::Value>,
    pub aud: Option<String>,
    pub iat: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub role: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn role_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.role.as_deref().filter(|role| !role.is_empty()).unwrap_or(fallback)
    }
}
