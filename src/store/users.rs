use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

const USERS_FILE: &str = "users.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub token: String,
    #[serde(default)]
    pub admin: bool,
}

/// Bearer tokens for API callers. The file is operator-managed; this store
/// only seeds it on first boot and reads it afterwards.
#[derive(Debug, Clone)]
pub struct UserStore {
    path: PathBuf,
}

impl UserStore {
    pub fn new(projects_dir: &std::path::Path) -> Self {
        Self {
            path: projects_dir.join(USERS_FILE),
        }
    }

    fn read_all(&self) -> Result<Vec<User>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        super::read_json(&self.path)
    }

    /// Create the users file with a single admin entry if it does not exist
    /// yet. Returns the seeded user, or None when the file was already there.
    pub fn ensure_seed(&self, admin_token: Option<&str>) -> Result<Option<User>> {
        if self.path.exists() {
            return Ok(None);
        }
        let user = User {
            id: "admin".to_string(),
            token: admin_token
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            admin: true,
        };
        super::write_json_atomic(&self.path, &vec![user.clone()])?;
        Ok(Some(user))
    }

    pub fn find_by_token(&self, token: &str) -> Result<Option<User>> {
        if token.is_empty() {
            return Ok(None);
        }
        Ok(self.read_all()?.into_iter().find(|u| u.token == token))
    }
}
