use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Birth profile owned by a user. Analyses reference profiles by id.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Profile {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub gender: String,
    pub birth_date: NaiveDate,
    pub birth_time: Option<String>,
    pub calendar_type: String,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
}

impl Profile {
    /// Birth data in the shape the analysis backend expects.
    pub fn backend_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "gender": self.gender,
            "birth_date": self.birth_date,
            "birth_time": self.birth_time.as_deref().unwrap_or("12:00"),
            "calendar_type": self.calendar_type,
            "is_lunar": self.calendar_type == "lunar",
        })
    }
}
