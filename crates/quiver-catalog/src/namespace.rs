//! Namespace and user delegation.
//!
//! Namespaces and users are owned by an optional authorization extension.
//! Without one, the catalog serves a single built-in `public` namespace and
//! refuses every user operation.

use std::sync::Arc;

use async_trait::async_trait;
use quiver_core::id::ArrayId;
use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};

/// Name of the built-in namespace.
pub const PUBLIC_NAMESPACE_NAME: &str = "public";

/// Id of the built-in namespace.
pub const PUBLIC_NAMESPACE_ID: u64 = 1;

/// A namespace grouping arrays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceDesc {
    /// Namespace id.
    pub id: u64,
    /// Namespace name.
    pub name: String,
}

impl NamespaceDesc {
    /// Creates a namespace descriptor.
    #[must_use]
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// The built-in `public` namespace.
    #[must_use]
    pub fn public() -> Self {
        Self::new(PUBLIC_NAMESPACE_ID, PUBLIC_NAMESPACE_NAME)
    }
}

/// A catalog user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDesc {
    /// User id; assigned by the extension.
    pub id: u64,
    /// User name.
    pub name: String,
    /// Stored password hash.
    pub password_hash: String,
}

/// Backend that owns namespaces and users.
#[async_trait]
pub trait AuthorizationExtension: Send + Sync + 'static {
    /// Creates a namespace.
    async fn create_namespace(&self, name: &str) -> Result<NamespaceDesc>;

    /// Drops a namespace.
    async fn drop_namespace(&self, name: &str) -> Result<()>;

    /// Looks up a namespace by name.
    async fn find_namespace(&self, name: &str) -> Result<Option<NamespaceDesc>>;

    /// Looks up a namespace by id.
    async fn find_namespace_by_id(&self, id: u64) -> Result<Option<NamespaceDesc>>;

    /// Lists namespaces.
    async fn get_namespaces(&self) -> Result<Vec<NamespaceDesc>>;

    /// Records `array_id` as a member of `namespace`.
    async fn add_array_to_namespace(
        &self,
        namespace: &NamespaceDesc,
        array_id: ArrayId,
    ) -> Result<()>;

    /// Returns the namespace `array_id` belongs to.
    async fn find_namespace_for_array(&self, array_id: ArrayId) -> Result<Option<NamespaceDesc>>;

    /// Creates a user and returns it with its assigned id.
    async fn create_user(&self, user: &UserDesc) -> Result<UserDesc>;

    /// Looks up a user by name.
    async fn find_user(&self, name: &str) -> Result<Option<UserDesc>>;

    /// Replaces the stored fields of an existing user.
    async fn change_user(&self, user: &UserDesc) -> Result<()>;

    /// Drops a user.
    async fn drop_user(&self, name: &str) -> Result<()>;

    /// Lists users.
    async fn get_users(&self) -> Result<Vec<UserDesc>>;
}

/// Namespace and user operations, delegated to an extension when present.
#[derive(Clone, Default)]
pub struct Namespaces {
    extension: Option<Arc<dyn AuthorizationExtension>>,
}

impl std::fmt::Debug for Namespaces {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespaces")
            .field("extension", &self.extension.is_some())
            .finish()
    }
}

impl Namespaces {
    /// Creates the facade, optionally backed by an extension.
    #[must_use]
    pub fn new(extension: Option<Arc<dyn AuthorizationExtension>>) -> Self {
        Self { extension }
    }

    /// Returns whether an extension is installed.
    #[must_use]
    pub fn has_extension(&self) -> bool {
        self.extension.is_some()
    }

    fn require(&self, operation: &'static str) -> Result<&dyn AuthorizationExtension> {
        self.extension
            .as_deref()
            .ok_or(CatalogError::ExtensionUnavailable { operation })
    }

    /// Creates a namespace.
    ///
    /// # Errors
    ///
    /// [`CatalogError::ExtensionUnavailable`] without an extension.
    pub async fn create_namespace(&self, name: &str) -> Result<NamespaceDesc> {
        let created = self.require("create_namespace")?.create_namespace(name).await?;
        tracing::info!(namespace = name, id = created.id, "namespace created");
        Ok(created)
    }

    /// Drops a namespace.
    ///
    /// # Errors
    ///
    /// [`CatalogError::ExtensionUnavailable`] without an extension.
    pub async fn drop_namespace(&self, name: &str) -> Result<()> {
        self.require("drop_namespace")?.drop_namespace(name).await?;
        tracing::info!(namespace = name, "namespace dropped");
        Ok(())
    }

    /// Looks up a namespace by name; `None` when absent.
    ///
    /// # Errors
    ///
    /// Errors reported by the extension.
    pub async fn find_namespace(&self, name: &str) -> Result<Option<NamespaceDesc>> {
        match &self.extension {
            Some(extension) => extension.find_namespace(name).await,
            None => Ok((name == PUBLIC_NAMESPACE_NAME).then(NamespaceDesc::public)),
        }
    }

    /// Looks up a namespace by name.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] when absent.
    pub async fn get_namespace(&self, name: &str) -> Result<NamespaceDesc> {
        self.find_namespace(name)
            .await?
            .ok_or_else(|| CatalogError::not_found("namespace", name))
    }

    /// Looks up a namespace by id; `None` when absent.
    ///
    /// # Errors
    ///
    /// Errors reported by the extension.
    pub async fn find_namespace_by_id(&self, id: u64) -> Result<Option<NamespaceDesc>> {
        match &self.extension {
            Some(extension) => extension.find_namespace_by_id(id).await,
            None => Ok((id == PUBLIC_NAMESPACE_ID).then(NamespaceDesc::public)),
        }
    }

    /// Lists namespaces; only `public` without an extension.
    ///
    /// # Errors
    ///
    /// Errors reported by the extension.
    pub async fn get_namespaces(&self) -> Result<Vec<NamespaceDesc>> {
        match &self.extension {
            Some(extension) => extension.get_namespaces().await,
            None => Ok(vec![NamespaceDesc::public()]),
        }
    }

    /// Records `array_id` as a member of `namespace`.
    ///
    /// # Errors
    ///
    /// [`CatalogError::ExtensionUnavailable`] without an extension.
    pub async fn add_array_to_namespace(
        &self,
        namespace: &NamespaceDesc,
        array_id: ArrayId,
    ) -> Result<()> {
        self.require("add_array_to_namespace")?
            .add_array_to_namespace(namespace, array_id)
            .await
    }

    /// Returns the namespace of `array_id`; every array is in `public`
    /// without an extension.
    ///
    /// # Errors
    ///
    /// [`CatalogError::NotFound`] if the extension knows no namespace for it.
    pub async fn get_namespace_for_array(&self, array_id: ArrayId) -> Result<NamespaceDesc> {
        match &self.extension {
            Some(extension) => extension
                .find_namespace_for_array(array_id)
                .await?
                .ok_or_else(|| CatalogError::not_found("namespace for array", array_id)),
            None => Ok(NamespaceDesc::public()),
        }
    }

    /// Creates a user.
    ///
    /// # Errors
    ///
    /// [`CatalogError::ExtensionUnavailable`] without an extension.
    pub async fn create_user(&self, user: &UserDesc) -> Result<UserDesc> {
        let created = self.require("create_user")?.create_user(user).await?;
        tracing::info!(user = %created.name, id = created.id, "user created");
        Ok(created)
    }

    /// Looks up a user.
    ///
    /// # Errors
    ///
    /// [`CatalogError::ExtensionUnavailable`] without an extension,
    /// [`CatalogError::NotFound`] when absent.
    pub async fn get_user(&self, name: &str) -> Result<UserDesc> {
        self.require("find_user")?
            .find_user(name)
            .await?
            .ok_or_else(|| CatalogError::not_found("user", name))
    }

    /// Replaces the stored fields of a user.
    ///
    /// # Errors
    ///
    /// [`CatalogError::ExtensionUnavailable`] without an extension.
    pub async fn change_user(&self, user: &UserDesc) -> Result<()> {
        self.require("change_user")?.change_user(user).await
    }

    /// Drops a user.
    ///
    /// # Errors
    ///
    /// [`CatalogError::ExtensionUnavailable`] without an extension.
    pub async fn drop_user(&self, name: &str) -> Result<()> {
        self.require("drop_user")?.drop_user(name).await?;
        tracing::info!(user = name, "user dropped");
        Ok(())
    }

    /// Lists users.
    ///
    /// # Errors
    ///
    /// [`CatalogError::ExtensionUnavailable`] without an extension.
    pub async fn get_users(&self) -> Result<Vec<UserDesc>> {
        self.require("get_users")?.get_users().await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tokio::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct InMemoryAuth {
        namespaces: Mutex<BTreeMap<String, u64>>,
        members: Mutex<BTreeMap<ArrayId, u64>>,
        users: Mutex<BTreeMap<String, UserDesc>>,
    }

    #[async_trait]
    impl AuthorizationExtension for InMemoryAuth {
        async fn create_namespace(&self, name: &str) -> Result<NamespaceDesc> {
            let mut namespaces = self.namespaces.lock().await;
            if namespaces.contains_key(name) {
                return Err(CatalogError::already_exists("namespace", name));
            }
            let id = namespaces.len() as u64 + 2;
            namespaces.insert(name.to_string(), id);
            Ok(NamespaceDesc::new(id, name))
        }

        async fn drop_namespace(&self, name: &str) -> Result<()> {
            self.namespaces
                .lock()
                .await
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| CatalogError::not_found("namespace", name))
        }

        async fn find_namespace(&self, name: &str) -> Result<Option<NamespaceDesc>> {
            Ok(self
                .namespaces
                .lock()
                .await
                .get(name)
                .map(|id| NamespaceDesc::new(*id, name)))
        }

        async fn find_namespace_by_id(&self, id: u64) -> Result<Option<NamespaceDesc>> {
            Ok(self
                .namespaces
                .lock()
                .await
                .iter()
                .find(|(_, ns)| **ns == id)
                .map(|(name, id)| NamespaceDesc::new(*id, name.clone())))
        }

        async fn get_namespaces(&self) -> Result<Vec<NamespaceDesc>> {
            Ok(self
                .namespaces
                .lock()
                .await
                .iter()
                .map(|(name, id)| NamespaceDesc::new(*id, name.clone()))
                .collect())
        }

        async fn add_array_to_namespace(
            &self,
            namespace: &NamespaceDesc,
            array_id: ArrayId,
        ) -> Result<()> {
            self.members.lock().await.insert(array_id, namespace.id);
            Ok(())
        }

        async fn find_namespace_for_array(&self, array_id: ArrayId) -> Result<Option<NamespaceDesc>> {
            let Some(id) = self.members.lock().await.get(&array_id).copied() else {
                return Ok(None);
            };
            self.find_namespace_by_id(id).await
        }

        async fn create_user(&self, user: &UserDesc) -> Result<UserDesc> {
            let mut users = self.users.lock().await;
            let created = UserDesc {
                id: users.len() as u64 + 1,
                ..user.clone()
            };
            users.insert(user.name.clone(), created.clone());
            Ok(created)
        }

        async fn find_user(&self, name: &str) -> Result<Option<UserDesc>> {
            Ok(self.users.lock().await.get(name).cloned())
        }

        async fn change_user(&self, user: &UserDesc) -> Result<()> {
            match self.users.lock().await.get_mut(&user.name) {
                Some(stored) => {
                    stored.password_hash.clone_from(&user.password_hash);
                    Ok(())
                }
                None => Err(CatalogError::not_found("user", &user.name)),
            }
        }

        async fn drop_user(&self, name: &str) -> Result<()> {
            self.users.lock().await.remove(name);
            Ok(())
        }

        async fn get_users(&self) -> Result<Vec<UserDesc>> {
            Ok(self.users.lock().await.values().cloned().collect())
        }
    }

    fn user(name: &str) -> UserDesc {
        UserDesc {
            id: 0,
            name: name.to_string(),
            password_hash: "x".to_string(),
        }
    }

    #[tokio::test]
    async fn test_public_fallback_without_extension() {
        let namespaces = Namespaces::default();
        assert!(!namespaces.has_extension());

        assert_eq!(
            namespaces.get_namespace("public").await.expect("public"),
            NamespaceDesc::public()
        );
        assert!(namespaces.find_namespace("other").await.expect("find").is_none());
        assert!(matches!(
            namespaces.get_namespace("other").await,
            Err(CatalogError::NotFound { .. })
        ));
        assert_eq!(
            namespaces.get_namespaces().await.expect("list"),
            vec![NamespaceDesc::public()]
        );
        assert_eq!(
            namespaces
                .get_namespace_for_array(ArrayId::new(5))
                .await
                .expect("array namespace"),
            NamespaceDesc::public()
        );
        assert_eq!(
            namespaces
                .find_namespace_by_id(PUBLIC_NAMESPACE_ID)
                .await
                .expect("by id"),
            Some(NamespaceDesc::public())
        );
    }

    #[tokio::test]
    async fn test_mutations_and_users_need_extension() {
        let namespaces = Namespaces::default();
        assert!(matches!(
            namespaces.create_namespace("ns").await,
            Err(CatalogError::ExtensionUnavailable {
                operation: "create_namespace"
            })
        ));
        assert!(matches!(
            namespaces.create_user(&user("alice")).await,
            Err(CatalogError::ExtensionUnavailable { .. })
        ));
        assert!(matches!(
            namespaces.get_users().await,
            Err(CatalogError::ExtensionUnavailable { .. })
        ));
        assert!(matches!(
            namespaces.drop_user("alice").await,
            Err(CatalogError::ExtensionUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_delegates_to_extension() {
        let namespaces = Namespaces::new(Some(Arc::new(InMemoryAuth::default())));

        let ns = namespaces.create_namespace("science").await.expect("create");
        assert_eq!(namespaces.get_namespace("science").await.expect("get"), ns);
        assert!(namespaces.find_namespace("public").await.expect("find").is_none());

        namespaces
            .add_array_to_namespace(&ns, ArrayId::new(7))
            .await
            .expect("member");
        assert_eq!(
            namespaces
                .get_namespace_for_array(ArrayId::new(7))
                .await
                .expect("lookup"),
            ns
        );
        assert!(namespaces.get_namespace_for_array(ArrayId::new(8)).await.is_err());

        let alice = namespaces.create_user(&user("alice")).await.expect("user");
        assert_eq!(alice.id, 1);
        let changed = UserDesc {
            password_hash: "y".to_string(),
            ..alice.clone()
        };
        namespaces.change_user(&changed).await.expect("change");
        assert_eq!(
            namespaces.get_user("alice").await.expect("get").password_hash,
            "y"
        );
        namespaces.drop_user("alice").await.expect("drop");
        assert!(namespaces.get_users().await.expect("list").is_empty());

        namespaces.drop_namespace("science").await.expect("drop ns");
        assert!(namespaces.get_namespaces().await.expect("list").is_empty());
    }
}
