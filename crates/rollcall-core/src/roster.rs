//! Enrollment roster: registered users, their embeddings, and the active user.

use crate::types::{Embedding, EnrolledUser, NewUser};
use chrono::Utc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RosterError {
    #[error("user not found: {0}")]
    NotFound(String),
    #[error("username already registered: {0}")]
    UsernameTaken(String),
}

#[derive(Debug, Clone, Default)]
pub struct Roster {
    users: Vec<EnrolledUser>,
    active: Option<String>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a roster from persisted parts. An active id that no longer
    /// names a user is dropped.
    pub fn from_parts(users: Vec<EnrolledUser>, active: Option<String>) -> Self {
        let active = active.filter(|id| {
            let known = users.iter().any(|u| &u.id == id);
            if !known {
                tracing::warn!(user_id = %id, "active user not on roster; clearing");
            }
            known
        });
        Self { users, active }
    }

    /// Register a new user and make them the active user.
    pub fn register(&mut self, new: NewUser) -> Result<EnrolledUser, RosterError> {
        if self.find_by_username(&new.username).is_some() {
            return Err(RosterError::UsernameTaken(new.username));
        }

        let user = EnrolledUser {
            id: uuid::Uuid::new_v4().to_string(),
            username: new.username,
            display_name: new.display_name,
            contact: new.contact,
            course_id: new.course_id,
            embedding: new.embedding,
            registered_at: Utc::now(),
        };

        tracing::info!(
            user_id = %user.id,
            username = %user.username,
            has_embedding = user.embedding.is_some(),
            "user registered"
        );

        self.active = Some(user.id.clone());
        self.users.push(user.clone());
        Ok(user)
    }

    /// Replace the stored embedding for a user.
    pub fn update_embedding(&mut self, user_id: &str, embedding: Embedding) -> Result<(), RosterError> {
        let user = self
            .users
            .iter_mut()
            .find(|u| u.id == user_id)
            .ok_or_else(|| RosterError::NotFound(user_id.to_string()))?;

        tracing::info!(user_id, dims = embedding.len(), "embedding updated");
        user.embedding = Some(embedding);
        Ok(())
    }

    /// Set (or clear) the active user for the session.
    pub fn set_active(&mut self, user_id: Option<&str>) -> Result<(), RosterError> {
        match user_id {
            Some(id) => {
                if self.get(id).is_none() {
                    return Err(RosterError::NotFound(id.to_string()));
                }
                self.active = Some(id.to_string());
            }
            None => self.active = None,
        }
        Ok(())
    }

    pub fn active(&self) -> Option<&EnrolledUser> {
        self.active.as_deref().and_then(|id| self.get(id))
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn get(&self, user_id: &str) -> Option<&EnrolledUser> {
        self.users.iter().find(|u| u.id == user_id)
    }

    pub fn find_by_username(&self, username: &str) -> Option<&EnrolledUser> {
        self.users.iter().find(|u| u.username == username)
    }

    /// Look a user up by id, falling back to username.
    pub fn resolve(&self, key: &str) -> Option<&EnrolledUser> {
        self.get(key).or_else(|| self.find_by_username(key))
    }

    /// All users in registration order.
    pub fn users(&self) -> &[EnrolledUser] {
        &self.users
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
