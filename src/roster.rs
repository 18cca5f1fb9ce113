//! Classroom roster lookup.
//!
//! Course records live in another system; this crate only needs to know who
//! belongs to which classroom and in what capacity.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassroomRole {
    Student,
    Instructor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub user_id: String,
    pub classroom: String,
    pub role: ClassroomRole,
}

#[derive(Debug, thiserror::Error)]
pub enum RosterError {
    #[error("no membership for {user} in {classroom}")]
    NotFound { user: String, classroom: String },

    #[error("roster unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Roster: Send + Sync {
    async fn membership(&self, user_id: &str, classroom: &str) -> Result<Membership, RosterError>;

    /// Every classroom the user belongs to.
    async fn classrooms_of(&self, user_id: &str) -> Result<Vec<Membership>, RosterError>;
}

/// Roster file layout:
///
/// ```json
/// { "classrooms": { "CS101": { "instructors": ["prof"], "students": ["alice"] } } }
/// ```
#[derive(Debug, Default, Deserialize)]
struct RosterFile {
    #[serde(default)]
    classrooms: HashMap<String, ClassroomEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct ClassroomEntry {
    #[serde(default)]
    instructors: Vec<String>,
    #[serde(default)]
    students: Vec<String>,
}

/// In-memory roster, optionally seeded from a JSON file.
#[derive(Default)]
pub struct StaticRoster {
    // classroom -> user -> role
    classrooms: RwLock<HashMap<String, HashMap<String, ClassroomRole>>>,
}

impl StaticRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let file: RosterFile = serde_json::from_str(raw)?;
        let mut classrooms = HashMap::new();
        for (code, entry) in file.classrooms {
            let mut members = HashMap::new();
            for student in entry.students {
                members.insert(student, ClassroomRole::Student);
            }
            // Instructor wins if a user is listed twice.
            for instructor in entry.instructors {
                members.insert(instructor, ClassroomRole::Instructor);
            }
            classrooms.insert(code, members);
        }
        Ok(Self {
            classrooms: RwLock::new(classrooms),
        })
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("read roster {}: {}", path.display(), e))?;
        let roster = Self::from_json(&raw)
            .map_err(|e| format!("parse roster {}: {}", path.display(), e))?;
        info!(path = %path.display(), "Loaded classroom roster");
        Ok(roster)
    }

    pub async fn enroll(&self, user_id: &str, classroom: &str, role: ClassroomRole) {
        self.classrooms
            .write()
            .await
            .entry(classroom.to_string())
            .or_default()
            .insert(user_id.to_string(), role);
    }

    pub async fn remove_classroom(&self, classroom: &str) -> bool {
        self.classrooms.write().await.remove(classroom).is_some()
    }
}

#[async_trait]
impl Roster for StaticRoster {
    async fn membership(&self, user_id: &str, classroom: &str) -> Result<Membership, RosterError> {
        let classrooms = self.classrooms.read().await;
        classrooms
            .get(classroom)
            .and_then(|members| members.get(user_id))
            .map(|role| Membership {
                user_id: user_id.to_string(),
                classroom: classroom.to_string(),
                role: *role,
            })
            .ok_or_else(|| RosterError::NotFound {
                user: user_id.to_string(),
                classroom: classroom.to_string(),
            })
    }

    async fn classrooms_of(&self, user_id: &str) -> Result<Vec<Membership>, RosterError> {
        let classrooms = self.classrooms.read().await;
        let mut memberships: Vec<Membership> = classrooms
            .iter()
            .filter_map(|(code, members)| {
                members.get(user_id).map(|role| Membership {
                    user_id: user_id.to_string(),
                    classroom: code.clone(),
                    role: *role,
                })
            })
            .collect();
        memberships.sort_by(|a, b| a.classroom.cmp(&b.classroom));
        Ok(memberships)
    }
}
