use std::collections::HashSet;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::{Company, MonitoringStore, Post, StoreError};

/// The company account that sees every post.
pub const ADMIN_USERNAME: &str = "admin";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoginError {
    #[error("Invalid username or password.")]
    InvalidCredentials,
    #[error("Your account is pending approval.")]
    PendingApproval,
    #[error("Login failed: {0}")]
    Store(#[from] StoreError),
}

/// A logged-in company.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer {
    pub company_id: i64,
    pub username: String,
    pub company_name: String,
    pub is_admin: bool,
}

impl Viewer {
    pub fn from_company(company: &Company) -> Self {
        Self {
            company_id: company.id,
            username: company.username.clone(),
            company_name: company.name.clone(),
            is_admin: company.username == ADMIN_USERNAME,
        }
    }

    pub fn owns(&self, post: &Post) -> bool {
        post.company_id == self.company_id
    }
}

pub async fn login(
    store: &dyn MonitoringStore,
    username: &str,
    password: &str,
) -> Result<Viewer, LoginError> {
    let company = store
        .find_company_by_username(username)
        .await?
        .filter(|company| company.password == password)
        .ok_or_else(|| {
            warn!(username, "Login rejected: invalid credentials.");
            LoginError::InvalidCredentials
        })?;
    if company.blocked {
        info!(username, "Login rejected: account pending approval.");
        return Err(LoginError::PendingApproval);
    }
    let viewer = Viewer::from_company(&company);
    info!(username, company_id = viewer.company_id, admin = viewer.is_admin, "Viewer logged in.");
    Ok(viewer)
}

/// Who is looking and which posts exist, read by feed and scheduler handlers
/// at dispatch time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewerSnapshot {
    pub viewer: Option<Viewer>,
    pub posts: Vec<Post>,
}

impl ViewerSnapshot {
    pub fn new(viewer: Option<Viewer>, posts: Vec<Post>) -> Self {
        Self { viewer, posts }
    }

    pub fn post(&self, post_id: i64) -> Option<&Post> {
        self.posts.iter().find(|post| post.id == post_id)
    }

    /// Admin sees every post; a company sees its own. Nobody logged in sees none.
    pub fn authorized_for(&self, post_id: i64) -> bool {
        match &self.viewer {
            None => false,
            Some(viewer) if viewer.is_admin => true,
            Some(viewer) => self.post(post_id).is_some_and(|post| viewer.owns(post)),
        }
    }

    pub fn visible_posts(&self) -> Vec<&Post> {
        self.posts
            .iter()
            .filter(|post| self.authorized_for(post.id))
            .collect()
    }

    pub fn visible_post_ids(&self) -> HashSet<i64> {
        self.visible_posts().into_iter().map(|post| post.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    fn company(id: i64, username: &str, blocked: bool) -> Company {
        Company {
            id,
            name: format!("Empresa {id}"),
            username: username.into(),
            password: "pw".into(),
            blocked,
        }
    }

    fn post(id: i64, company_id: i64) -> Post {
        Post {
            id,
            company_id,
            name: format!("Posto {id}"),
            location: String::new(),
            blocked: false,
            access_secret: String::new(),
            last_heartbeat: None,
        }
    }

    #[tokio::test]
    async fn test_login_outcomes() {
        let store = MemoryStore::new();
        store.add_company(company(1, "admin", false));
        store.add_company(company(2, "acme", true));

        let admin = login(&store, "admin", "pw").await.unwrap();
        assert!(admin.is_admin);
        assert_eq!(login(&store, "admin", "nope").await, Err(LoginError::InvalidCredentials));
        assert_eq!(login(&store, "ghost", "pw").await, Err(LoginError::InvalidCredentials));
        assert_eq!(login(&store, "acme", "pw").await, Err(LoginError::PendingApproval));

        store.set_unreachable(true);
        assert!(matches!(login(&store, "admin", "pw").await, Err(LoginError::Store(_))));
    }

    #[test]
    fn test_authorization_follows_ownership() {
        let posts = vec![post(10, 2), post(11, 3)];
        let owner = Viewer::from_company(&company(2, "acme", false));
        let admin = Viewer::from_company(&company(1, "admin", false));

        let snapshot = ViewerSnapshot::new(Some(owner), posts.clone());
        assert!(snapshot.authorized_for(10));
        assert!(!snapshot.authorized_for(11));
        assert!(!snapshot.authorized_for(99));
        assert_eq!(snapshot.visible_post_ids(), HashSet::from([10]));

        let snapshot = ViewerSnapshot::new(Some(admin), posts.clone());
        assert_eq!(snapshot.visible_posts().len(), 2);

        assert!(ViewerSnapshot::new(None, posts).visible_posts().is_empty());
    }
}
