//! Per-session project resolution with positive and negative caching.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use lattice_model::{vpath, ProjectRecord};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::traits::ProjectStore;

/// Resolves the leading path segment of a virtual path to a project the
/// session's user may access.
///
/// Results are cached for the lifetime of the session, in two disjoint
/// maps: slugs that resolved, and slugs that are missing or forbidden.
/// A denied slug never hits the store again, and a missing project is
/// indistinguishable from a forbidden one so clients cannot probe for
/// project names. Resolved projects are not re-validated within a
/// session.
pub struct ProjectResolver {
    user_id: i64,
    projects: Arc<dyn ProjectStore>,
    resolved: Mutex<HashMap<String, ProjectRecord>>,
    denied: Mutex<HashSet<String>>,
}

impl ProjectResolver {
    pub fn new(user_id: i64, projects: Arc<dyn ProjectStore>) -> Self {
        ProjectResolver {
            user_id,
            projects,
            resolved: Mutex::new(HashMap::new()),
            denied: Mutex::new(HashSet::new()),
        }
    }

    /// Resolve the project a virtual path belongs to. The synthetic root
    /// (empty slug) is not a project and resolves to `NotFound`; callers
    /// that want the root listing never reach here.
    pub async fn resolve(&self, path: &str) -> Result<ProjectRecord> {
        let (slug, _) = vpath::split(path);
        if slug.is_empty() {
            return Err(StoreError::NotFound("no project in path".to_string()));
        }

        if let Some(project) = self.lookup_resolved(&slug) {
            return Ok(project);
        }
        if self.is_denied(&slug) {
            return Err(not_found(&slug));
        }

        let project = match self.projects.get_project_by_slug(&slug).await {
            Ok(project) => project,
            Err(err) => {
                debug!(%slug, %err, "project lookup failed");
                self.deny(&slug);
                return Err(not_found(&slug));
            }
        };

        match self.projects.user_can_access_project(self.user_id, project.id).await {
            Ok(true) => {
                self.remember(&slug, &project);
                Ok(project)
            }
            Ok(false) => {
                debug!(user_id = self.user_id, project_id = project.id, "access denied");
                self.deny(&slug);
                Err(not_found(&slug))
            }
            Err(err) => {
                debug!(%slug, %err, "access check failed");
                self.deny(&slug);
                Err(not_found(&slug))
            }
        }
    }

    fn lookup_resolved(&self, slug: &str) -> Option<ProjectRecord> {
        self.resolved
            .lock()
            .ok()
            .and_then(|cache| cache.get(slug).cloned())
    }

    fn is_denied(&self, slug: &str) -> bool {
        self.denied
            .lock()
            .map(|cache| cache.contains(slug))
            .unwrap_or(false)
    }

    fn remember(&self, slug: &str, project: &ProjectRecord) {
        if let Ok(mut cache) = self.resolved.lock() {
            cache.insert(slug.to_string(), project.clone());
        }
    }

    fn deny(&self, slug: &str) {
        if let Ok(mut cache) = self.denied.lock() {
            cache.insert(slug.to_string());
        }
    }
}

fn not_found(slug: &str) -> StoreError {
    StoreError::NotFound(format!("no such project {slug}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::sqlite::SqliteStore;

    /// Wraps a project store and counts how often each operation reaches
    /// the backend, so the caching contract can be asserted.
    struct CountingProjects {
        inner: Arc<SqliteStore>,
        lookups: AtomicUsize,
        access_checks: AtomicUsize,
    }

    #[async_trait]
    impl ProjectStore for CountingProjects {
        async fn get_project_by_slug(&self, slug: &str) -> Result<ProjectRecord> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.get_project_by_slug(slug).await
        }

        async fn user_can_access_project(&self, user_id: i64, project_id: i64) -> Result<bool> {
            self.access_checks.fetch_add(1, Ordering::SeqCst);
            self.inner.user_can_access_project(user_id, project_id).await
        }

        async fn projects_for_user(&self, user_id: i64) -> Result<Vec<ProjectRecord>> {
            self.inner.projects_for_user(user_id).await
        }
    }

    fn fixture() -> (Arc<CountingProjects>, i64) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let alice = store.create_user("alice", "Alice", "hash").unwrap();
        let bob = store.create_user("bob", "Bob", "hash").unwrap();
        store.create_project("Alloy 42", "alloy-42", alice.id).unwrap();
        store.create_project("Bob Private", "bob-private", bob.id).unwrap();
        let counting = Arc::new(CountingProjects {
            inner: store,
            lookups: AtomicUsize::new(0),
            access_checks: AtomicUsize::new(0),
        });
        (counting, alice.id)
    }

    #[tokio::test]
    async fn resolve_caches_positive_results() {
        let (projects, alice) = fixture();
        let resolver = ProjectResolver::new(alice, projects.clone());

        let first = resolver.resolve("/alloy-42/dir/file.txt").await.unwrap();
        let second = resolver.resolve("/alloy-42").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(projects.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(projects.access_checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn denied_slugs_never_hit_the_store_again() {
        let (projects, alice) = fixture();
        let resolver = ProjectResolver::new(alice, projects.clone());

        for _ in 0..3 {
            assert!(matches!(
                resolver.resolve("/bob-private/data").await,
                Err(StoreError::NotFound(_))
            ));
        }
        assert_eq!(projects.lookups.load(Ordering::SeqCst), 1);

        for _ in 0..3 {
            assert!(matches!(
                resolver.resolve("/never-existed").await,
                Err(StoreError::NotFound(_))
            ));
        }
        assert_eq!(projects.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_and_forbidden_look_identical() {
        let (projects, alice) = fixture();
        let resolver = ProjectResolver::new(alice, projects.clone());

        let missing = resolver.resolve("/never-existed").await.unwrap_err();
        let forbidden = resolver.resolve("/bob-private").await.unwrap_err();
        assert_eq!(
            std::mem::discriminant(&missing),
            std::mem::discriminant(&forbidden)
        );
    }

    #[tokio::test]
    async fn synthetic_root_is_not_a_project() {
        let (projects, alice) = fixture();
        let resolver = ProjectResolver::new(alice, projects);
        assert!(matches!(
            resolver.resolve("/").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
