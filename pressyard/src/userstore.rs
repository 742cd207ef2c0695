//! Users, their blogs, and the store holding both.
//!
//! The trait is the seam a SQL-backed implementation would fill; the
//! in-memory store is what the all-in-one deployment and the tests use.
//! Passwords are stored as argon2 PHC strings, never in clear.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier as _, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// User record as handed to `create_user` / `update_user`.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub password: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub username: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blog {
    pub slug: String,
    pub display_name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum UserStoreError {
    #[error("user already exists")]
    AlreadyExists,
    #[error("user does not exist")]
    DoesNotExist,
    #[error("username cannot be empty")]
    UsernameEmpty,
    #[error("password cannot be empty")]
    PasswordEmpty,
    #[error("a blog with this slug already exists")]
    BlogAlreadyExists,
    #[error("blog does not exist")]
    BlogDoesNotExist,
    #[error("blog slug cannot be empty")]
    BlogSlugEmpty,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type DynUserStore = Arc<dyn UserStore>;

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create_user(&self, user: NewUser) -> Result<(), UserStoreError>;
    /// Updates the display name; updates the password only when non-empty.
    async fn update_user(&self, user: NewUser) -> Result<(), UserStoreError>;
    async fn get_user(&self, username: &str) -> Result<Option<UserProfile>, UserStoreError>;
    async fn authenticate_user(&self, username: &str, password: &str) -> Result<bool, UserStoreError>;
    async fn delete_user(&self, username: &str) -> Result<(), UserStoreError>;

    async fn add_blog(&self, username: &str, blog: Blog) -> Result<(), UserStoreError>;
    async fn update_blog(&self, username: &str, blog: Blog) -> Result<(), UserStoreError>;
    async fn get_blog(&self, username: &str, slug: &str) -> Result<Option<Blog>, UserStoreError>;
    async fn list_blogs(&self, username: &str) -> Result<Vec<Blog>, UserStoreError>;
    async fn delete_blog(&self, username: &str, slug: &str) -> Result<(), UserStoreError>;
}

fn validate_user(user: &NewUser, allow_empty_password: bool) -> Result<(), UserStoreError> {
    if user.username.is_empty() {
        return Err(UserStoreError::UsernameEmpty);
    }

    if !allow_empty_password && user.password.is_empty() {
        return Err(UserStoreError::PasswordEmpty);
    }

    Ok(())
}

fn validate_blog(blog: &Blog) -> Result<(), UserStoreError> {
    if blog.slug.is_empty() {
        return Err(UserStoreError::BlogSlugEmpty);
    }

    Ok(())
}

fn hash_password(password: &str) -> Result<String, UserStoreError> {
    let salt = SaltString::generate(&mut OsRng);

    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| UserStoreError::Internal(anyhow::anyhow!("failed to hash password: {e}")))
}

fn verify_password(hash: &str, password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };

    Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok()
}

struct UserRecord {
    password_hash: String,
    display_name: String,
    blogs: BTreeMap<String, Blog>,
}

#[derive(Default)]
pub struct MemoryUserStore {
    users: Mutex<HashMap<String, UserRecord>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn create_user(&self, user: NewUser) -> Result<(), UserStoreError> {
        validate_user(&user, false)?;

        let password_hash = hash_password(&user.password)?;

        let mut users = self.users.lock();

        if users.contains_key(&user.username) {
            return Err(UserStoreError::AlreadyExists);
        }

        users.insert(
            user.username,
            UserRecord {
                password_hash,
                display_name: user.display_name,
                blogs: BTreeMap::new(),
            },
        );

        Ok(())
    }

    async fn update_user(&self, user: NewUser) -> Result<(), UserStoreError> {
        validate_user(&user, true)?;

        let password_hash = if user.password.is_empty() {
            None
        } else {
            Some(hash_password(&user.password)?)
        };

        let mut users = self.users.lock();

        let record = users.get_mut(&user.username).ok_or(UserStoreError::DoesNotExist)?;

        record.display_name = user.display_name;

        if let Some(password_hash) = password_hash {
            record.password_hash = password_hash;
        }

        Ok(())
    }

    async fn get_user(&self, username: &str) -> Result<Option<UserProfile>, UserStoreError> {
        Ok(self.users.lock().get(username).map(|record| UserProfile {
            username: username.to_owned(),
            display_name: record.display_name.clone(),
        }))
    }

    async fn authenticate_user(&self, username: &str, password: &str) -> Result<bool, UserStoreError> {
        let password_hash = match self.users.lock().get(username) {
            Some(record) => record.password_hash.clone(),
            None => return Ok(false),
        };

        Ok(verify_password(&password_hash, password))
    }

    async fn delete_user(&self, username: &str) -> Result<(), UserStoreError> {
        match self.users.lock().remove(username) {
            Some(_) => Ok(()),
            None => Err(UserStoreError::DoesNotExist),
        }
    }

    async fn add_blog(&self, username: &str, blog: Blog) -> Result<(), UserStoreError> {
        validate_blog(&blog)?;

        let mut users = self.users.lock();
        let record = users.get_mut(username).ok_or(UserStoreError::DoesNotExist)?;

        if record.blogs.contains_key(&blog.slug) {
            return Err(UserStoreError::BlogAlreadyExists);
        }

        record.blogs.insert(blog.slug.clone(), blog);

        Ok(())
    }

    async fn update_blog(&self, username: &str, blog: Blog) -> Result<(), UserStoreError> {
        validate_blog(&blog)?;

        let mut users = self.users.lock();
        let record = users.get_mut(username).ok_or(UserStoreError::DoesNotExist)?;

        match record.blogs.get_mut(&blog.slug) {
            Some(existing) => {
                *existing = blog;
                Ok(())
            }
            None => Err(UserStoreError::BlogDoesNotExist),
        }
    }

    async fn get_blog(&self, username: &str, slug: &str) -> Result<Option<Blog>, UserStoreError> {
        Ok(self
            .users
            .lock()
            .get(username)
            .and_then(|record| record.blogs.get(slug))
            .cloned())
    }

    async fn list_blogs(&self, username: &str) -> Result<Vec<Blog>, UserStoreError> {
        Ok(self
            .users
            .lock()
            .get(username)
            .map(|record| record.blogs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_blog(&self, username: &str, slug: &str) -> Result<(), UserStoreError> {
        let mut users = self.users.lock();
        let record = users.get_mut(username).ok_or(UserStoreError::DoesNotExist)?;

        match record.blogs.remove(slug) {
            Some(_) => Ok(()),
            None => Err(UserStoreError::BlogDoesNotExist),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renderer() -> NewUser {
        NewUser {
            username: "renderer".to_owned(),
            password: "don't tell".to_owned(),
            display_name: "Renderer".to_owned(),
        }
    }

    #[tokio::test]
    async fn create_and_authenticate() {
        let store = MemoryUserStore::new();

        store.create_user(renderer()).await.expect("create");

        assert!(store.authenticate_user("renderer", "don't tell").await.expect("auth"));
        assert!(!store.authenticate_user("renderer", "wrong").await.expect("auth"));
        assert!(!store.authenticate_user("nobody", "don't tell").await.expect("auth"));

        let profile = store.get_user("renderer").await.expect("get").expect("profile");
        assert_eq!(profile.display_name, "Renderer");
    }

    #[tokio::test]
    async fn duplicate_create_is_a_conflict() {
        let store = MemoryUserStore::new();

        store.create_user(renderer()).await.expect("create");

        assert!(matches!(
            store.create_user(renderer()).await,
            Err(UserStoreError::AlreadyExists)
        ));
    }

    #[tokio::test]
    async fn empty_fields_are_rejected() {
        let store = MemoryUserStore::new();

        let mut user = renderer();
        user.username = String::new();
        assert!(matches!(
            store.create_user(user).await,
            Err(UserStoreError::UsernameEmpty)
        ));

        let mut user = renderer();
        user.password = String::new();
        assert!(matches!(
            store.create_user(user).await,
            Err(UserStoreError::PasswordEmpty)
        ));
    }

    #[tokio::test]
    async fn update_keeps_the_password_when_empty() {
        let store = MemoryUserStore::new();
        store.create_user(renderer()).await.expect("create");

        store
            .update_user(NewUser {
                username: "renderer".to_owned(),
                password: String::new(),
                display_name: "New name".to_owned(),
            })
            .await
            .expect("update");

        assert!(store.authenticate_user("renderer", "don't tell").await.expect("auth"));

        let profile = store.get_user("renderer").await.expect("get").expect("profile");
        assert_eq!(profile.display_name, "New name");
    }

    #[tokio::test]
    async fn blog_crud() {
        let store = MemoryUserStore::new();
        store.create_user(renderer()).await.expect("create");

        let blog = Blog {
            slug: "myblog".to_owned(),
            display_name: "My fancy blog".to_owned(),
        };

        store.add_blog("renderer", blog.clone()).await.expect("add");

        assert!(matches!(
            store.add_blog("renderer", blog.clone()).await,
            Err(UserStoreError::BlogAlreadyExists)
        ));

        assert_eq!(
            store.get_blog("renderer", "myblog").await.expect("get").as_ref(),
            Some(&blog)
        );
        assert_eq!(store.list_blogs("renderer").await.expect("list"), vec![blog.clone()]);

        store
            .update_blog(
                "renderer",
                Blog {
                    slug: "myblog".to_owned(),
                    display_name: "Renamed".to_owned(),
                },
            )
            .await
            .expect("update");

        let updated = store.get_blog("renderer", "myblog").await.expect("get").expect("blog");
        assert_eq!(updated.display_name, "Renamed");

        store.delete_blog("renderer", "myblog").await.expect("delete");
        assert!(store.get_blog("renderer", "myblog").await.expect("get").is_none());
        assert!(matches!(
            store.delete_blog("renderer", "myblog").await,
            Err(UserStoreError::BlogDoesNotExist)
        ));
    }
}
