// User registration
// Accounts are created by the auth collaborator's callback and removed by
// admins. User counts feed the cached dashboard, so both writes purge it.

use chrono::NaiveDate;
use std::sync::Arc;
use tracing::info;

use crate::analytics::{system_clock, Clock};
use crate::catalog::Actor;
use crate::codec::Codec;
use crate::document_store::{DocumentStore, Gender, Role, User, UserFilter};
use crate::error::CatalogError;
use crate::invalidation::{InvalidationCoordinator, InvalidationTags};
use crate::read_through::CacheContext;

#[derive(Debug, Clone, PartialEq)]
pub struct NewUser {
    // Issued by the identity provider
    pub id: String,
    pub name: String,
    pub gender: Gender,
    pub dob: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    // The id was already registered; nothing changed
    Existing,
}

/// Fails with `Unauthorized` unless the actor has a stored account.
pub(crate) async fn require_registered(
    store: &dyn DocumentStore,
    actor: &Actor,
) -> Result<User, CatalogError> {
    store
        .get_user(&actor.user_id)
        .await?
        .ok_or_else(|| CatalogError::Unauthorized(format!("user {} is not logged in", actor.user_id)))
}

pub struct UserService {
    store: Arc<dyn DocumentStore>,
    coordinator: Arc<InvalidationCoordinator>,
    clock: Clock,
}

impl UserService {
    pub fn new<C: Codec>(store: Arc<dyn DocumentStore>, context: &CacheContext<C>) -> Self {
        Self {
            store,
            coordinator: context.coordinator(),
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Registers a new customer account. Registering an id that already
    /// exists returns the stored user untouched.
    pub async fn create_user(&self, new_user: NewUser) -> Result<(User, Registration), CatalogError> {
        if new_user.id.trim().is_empty() || new_user.name.trim().is_empty() {
            return Err(CatalogError::Validation(
                "user id and name are required".to_string(),
            ));
        }
        let now = (self.clock)();
        if new_user.dob > now.date_naive() {
            return Err(CatalogError::Validation(
                "date of birth is in the future".to_string(),
            ));
        }

        if let Some(existing) = self.store.get_user(&new_user.id).await? {
            return Ok((existing, Registration::Existing));
        }

        let user = User {
            id: new_user.id,
            name: new_user.name,
            gender: new_user.gender,
            role: Role::User,
            dob: new_user.dob,
            created_at: now,
        };
        let user = self.store.insert_user(user).await?;
        info!(user_id = %user.id, "user registered");

        self.coordinator
            .invalidate(&InvalidationTags::new().admin())
            .await?;
        Ok((user, Registration::Created))
    }

    pub async fn user(&self, id: &str) -> Result<User, CatalogError> {
        self.store
            .get_user(id)
            .await?
            .ok_or_else(|| CatalogError::NotFound(format!("user {}", id)))
    }

    pub async fn all_users(&self, actor: &Actor) -> Result<Vec<User>, CatalogError> {
        actor.require_admin()?;
        Ok(self.store.find_users(&UserFilter::default()).await?)
    }

    pub async fn delete_user(&self, actor: &Actor, id: &str) -> Result<User, CatalogError> {
        actor.require_admin()?;

        let user = self.user(id).await?;
        self.store.delete_user(id).await?;
        info!(user_id = %id, "user deleted");

        self.coordinator
            .invalidate(&InvalidationTags::new().admin())
            .await?;
        Ok(user)
    }
}
