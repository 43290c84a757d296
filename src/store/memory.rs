//! In-memory progress store. Used in tests and for ephemeral deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{check_append_only, Mutation, ProgressStore, UserProgress};
use crate::domain::UserId;
use crate::error::Result;

#[derive(Default)]
pub struct MemoryStore {
  users: RwLock<HashMap<UserId, UserProgress>>,
}

#[allow(dead_code)]
impl MemoryStore {
  pub fn new() -> Self { Self::default() }
}

#[async_trait]
impl ProgressStore for MemoryStore {
  async fn load(&self, user: &UserId) -> Result<UserProgress> {
    Ok(self.users.read().await.get(user).cloned().unwrap_or_default())
  }

  async fn update(&self, user: &UserId, f: Mutation) -> Result<UserProgress> {
    let mut users = self.users.write().await;
    let before = users.get(user).cloned().unwrap_or_default();
    let mut after = before.clone();
    f(&mut after);
    check_append_only(&before, &after)?;
    users.insert(user.clone(), after.clone());
    Ok(after)
  }
}
