use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct Poll {
    pub id: String,
    pub question: String,
    pub options: Vec<String>,
    pub created_at: DateTime<Utc>,
}

// Cumulative result for one option of a stored poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionResult {
    pub option: String,
    pub votes: i64,
}

impl Poll {
    pub fn new(question: String, options: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            question,
            options,
            created_at: Utc::now(),
        }
    }
}
