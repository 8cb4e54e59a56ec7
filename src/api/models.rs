use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Row of the `conversations` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: String,
    pub dog1_id: String,
    pub dog2_id: String,
    pub dog1_name: String,
    pub dog2_name: String,
    #[serde(default)]
    pub dog1_avatar_url: Option<String>,
    #[serde(default)]
    pub dog2_avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Row of the `messages` table. Also the record carried by change-feed inserts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub user_id: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    pub user: AuthUser,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AuthUser {
    pub id: String,
}

impl TokenResponse {
    pub fn into_session(self, now: DateTime<Utc>) -> Session {
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            user_id: self.user.id,
            expires_at: self.expires_in.map(|secs| now + chrono::Duration::seconds(secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_row_tolerates_missing_optionals() {
        let json = r#"{
            "id": "c1",
            "dog1_id": "d1",
            "dog2_id": "d2",
            "dog1_name": "Rex",
            "dog2_name": "Bella",
            "created_at": "2024-03-01T10:00:00.123456+00:00"
        }"#;
        let row: ConversationRow = serde_json::from_str(json).unwrap();
        assert_eq!(row.dog1_avatar_url, None);
        assert_eq!(row.last_message_at, None);
    }

    #[test]
    fn token_response_becomes_session() {
        let json = r#"{
            "access_token": "jwt",
            "token_type": "bearer",
            "expires_in": 3600,
            "refresh_token": "r1",
            "user": {"id": "u-1", "email": "owner@example.com"}
        }"#;
        let parsed: TokenResponse = serde_json::from_str(json).unwrap();
        let now = Utc::now();
        let session = parsed.into_session(now);
        assert_eq!(session.user_id, "u-1");
        assert_eq!(session.refresh_token.as_deref(), Some("r1"));
        assert!(!session.is_expired(now));
        assert!(session.is_expired(now + chrono::Duration::seconds(3600)));
    }
}
