//! Users known to the workflow engine, with their stored signing material.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::Serialize;

use super::model::UserId;
use crate::credential::StoredCredentials;

#[derive(Debug, Clone, Default)]
pub struct User {
    pub id: UserId,
    pub login: String,
    pub name: String,
    pub email: Option<String>,
    /// City of the user's company, written as the signature location.
    pub city: Option<String>,
    pub is_admin: bool,
    pub credentials: StoredCredentials,
}

impl User {
    pub fn new(id: UserId, login: impl Into<String>, name: impl Into<String>) -> Self {
        User {
            id,
            login: login.into(),
            name: name.into(),
            ..User::default()
        }
    }
}

pub trait Directory: Send + Sync {
    fn user(&self, id: UserId) -> Option<User>;
}

#[derive(Default)]
pub struct MemoryDirectory {
    users: RwLock<BTreeMap<UserId, User>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, user: User) {
        self.users.write().insert(user.id, user);
    }

    pub fn set_credentials(&self, id: UserId, credentials: StoredCredentials) -> bool {
        match self.users.write().get_mut(&id) {
            Some(user) => {
                user.credentials = credentials;
                true
            }
            None => false,
        }
    }

    pub fn users(&self) -> Vec<User> {
        self.users.read().values().cloned().collect()
    }
}

impl Directory for MemoryDirectory {
    fn user(&self, id: UserId) -> Option<User> {
        self.users.read().get(&id).cloned()
    }
}

/// Which parts of the signing material a user has on file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialStatus {
    pub user: UserId,
    pub login: String,
    pub name: String,
    pub has_p12: bool,
    pub has_password: bool,
    pub has_image: bool,
    /// All three present: the user can sign without supplying anything.
    pub ready: bool,
}

pub fn credential_report(users: &[User]) -> Vec<CredentialStatus> {
    users
        .iter()
        .map(|user| {
            let stored = &user.credentials;
            let has_p12 = stored.p12.as_ref().is_some_and(|p| !p.is_empty());
            let has_password = stored
                .password
                .as_deref()
                .is_some_and(|p| !p.trim().is_empty());
            let has_image = stored.image.as_ref().is_some_and(|i| !i.is_empty());
            CredentialStatus {
                user: user.id,
                login: user.login.clone(),
                name: user.name.clone(),
                has_p12,
                has_password,
                has_image,
                ready: has_p12 && has_password && has_image,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_flags() {
        let mut full = User::new(1, "ana", "Ana");
        full.credentials = StoredCredentials {
            p12: Some(vec![1]),
            password: Some("pw".to_string()),
            image: Some(vec![2]),
        };
        let mut partial = User::new(2, "luis", "Luis");
        partial.credentials.p12 = Some(vec![1]);
        partial.credentials.password = Some("  ".to_string());

        let report = credential_report(&[full, partial]);
        assert!(report[0].ready);
        assert!(report[1].has_p12);
        assert!(!report[1].has_password);
        assert!(!report[1].ready);
    }

    #[test]
    fn lookup_and_update() {
        let directory = MemoryDirectory::new();
        directory.add(User::new(3, "eva", "Eva"));
        assert!(directory.user(4).is_none());
        assert!(directory.set_credentials(
            3,
            StoredCredentials {
                image: Some(vec![9]),
                ..StoredCredentials::default()
            }
        ));
        assert!(!directory.set_credentials(4, StoredCredentials::default()));
        assert_eq!(directory.user(3).unwrap().credentials.image, Some(vec![9]));
        assert_eq!(directory.users().len(), 1);
    }
}
