use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::CatalogResult;
use crate::logic::authorization::Authorization;
use crate::logic::background::BackgroundExecutor;
use crate::model::{
    is_descendant_of, ActivityEvent, ActivityEventView, ActivityFilter, Id, Package, Principal,
};
use crate::store::traits::{EventQuery, Store};

/// Fire-and-forget sink: `track` never fails, persistence happens on the
/// background executor and failures are only logged.
pub struct ActivityTracker<S: Store> {
    store: Arc<S>,
    background: BackgroundExecutor,
}

impl<S: Store> Clone for ActivityTracker<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            background: self.background.clone(),
        }
    }
}

impl<S: Store + 'static> ActivityTracker<S> {
    pub fn new(store: Arc<S>, background: BackgroundExecutor) -> Self {
        Self { store, background }
    }

    pub fn track(&self, event: ActivityEvent) {
        let store = self.store.clone();
        let event_type = event.event_type;
        let package_id = event.package_id.clone();
        self.background.spawn("activity", async move {
            if let Err(e) = store.insert_events(vec![event]).await {
                log::error!(
                    "Failed to persist {} event for package '{}': {:#}",
                    event_type.as_str(),
                    package_id,
                    e
                );
            }
            Ok(())
        });
    }
}

/// Read side of the activity pipeline.
pub struct ActivityFeed<S: Store> {
    store: Arc<S>,
    auth: Authorization<S>,
}

impl<S: Store> Clone for ActivityFeed<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            auth: self.auth.clone(),
        }
    }
}

impl<S: Store + 'static> ActivityFeed<S> {
    pub fn new(store: Arc<S>, auth: Authorization<S>) -> Self {
        Self { store, auth }
    }

    /// Events of one package, and of its subtree when `include_refs` is set.
    pub async fn package_events(
        &self,
        principal: &Principal,
        package_id: &str,
        filter: &ActivityFilter,
    ) -> CatalogResult<Vec<ActivityEventView>> {
        let package = self
            .auth
            .check_package(principal, package_id, crate::model::Permission::Read)
            .await?;
        let mut ids = vec![package.id.clone()];
        if filter.include_refs {
            for child in self.store.list_descendants(&package.id).await? {
                if self.auth.can_read(principal, &child).await? {
                    ids.push(child.id);
                }
            }
        }
        self.query(Some(ids), filter).await
    }

    /// Events across every package the caller can read.
    pub async fn all_events(
        &self,
        principal: &Principal,
        filter: &ActivityFilter,
    ) -> CatalogResult<Vec<ActivityEventView>> {
        let favorites: BTreeSet<Id> = match principal.user_id() {
            Some(user_id) if filter.only_favorite => self
                .store
                .list_favorites(user_id)
                .await?
                .into_iter()
                .collect(),
            _ => BTreeSet::new(),
        };
        let shared: BTreeSet<Id> = match principal.user_id() {
            Some(user_id) if filter.only_shared => self
                .store
                .list_member_roles_for_user(user_id)
                .await?
                .into_iter()
                .map(|m| m.package_id)
                .collect(),
            _ => BTreeSet::new(),
        };
        let text = filter.text_filter.as_deref().map(str::to_lowercase);

        let mut ids = Vec::new();
        for package in self.store.list_packages().await? {
            if filter.only_favorite && !in_subtree_of(&package.id, &favorites) {
                continue;
            }
            if filter.only_shared && !in_subtree_of(&package.id, &shared) {
                continue;
            }
            if !filter.kinds.is_empty() && !filter.kinds.contains(&package.kind) {
                continue;
            }
            if let Some(text) = &text {
                if !package.id.to_lowercase().contains(text)
                    && !package.name.to_lowercase().contains(text)
                {
                    continue;
                }
            }
            if self.auth.can_read(principal, &package).await? {
                ids.push(package.id);
            }
        }
        self.query(Some(ids), filter).await
    }

    async fn query(
        &self,
        package_ids: Option<Vec<Id>>,
        filter: &ActivityFilter,
    ) -> CatalogResult<Vec<ActivityEventView>> {
        let events = self
            .store
            .list_events(EventQuery {
                package_ids,
                types: filter.types.clone(),
                offset: filter.paging.offset(),
                limit: filter.paging.limit,
            })
            .await?;
        self.enrich(events).await
    }

    async fn enrich(&self, events: Vec<ActivityEvent>) -> CatalogResult<Vec<ActivityEventView>> {
        let mut users: HashMap<String, Option<String>> = HashMap::new();
        let mut packages: HashMap<Id, Option<Package>> = HashMap::new();
        let mut latest: HashMap<(Id, String), Option<i32>> = HashMap::new();
        let mut views = Vec::with_capacity(events.len());

        for event in &events {
            if !users.contains_key(&event.user_id) {
                let name = self.store.get_user(&event.user_id).await?.map(|u| u.name);
                users.insert(event.user_id.clone(), name);
            }
            if !packages.contains_key(&event.package_id) {
                let package = self.store.get_package(&event.package_id).await?;
                packages.insert(event.package_id.clone(), package);
            }
            let latest_revision = match event.version_coordinates() {
                Some((version, _)) => {
                    let key = (event.package_id.clone(), version.clone());
                    if !latest.contains_key(&key) {
                        let revision = self
                            .store
                            .get_latest_revision(&event.package_id, &version)
                            .await?
                            .map(|r| r.revision);
                        latest.insert(key.clone(), revision);
                    }
                    latest.get(&key).copied().flatten()
                }
                None => None,
            };
            let package = packages.get(&event.package_id).and_then(|p| p.as_ref());
            views.push(ActivityEventView::enrich(
                event,
                users.get(&event.user_id).and_then(|n| n.as_deref()),
                package.map(|p| p.name.as_str()).unwrap_or(""),
                package.map(|p| p.kind),
                latest_revision,
            ));
        }
        Ok(views)
    }
}

fn in_subtree_of(id: &str, roots: &BTreeSet<Id>) -> bool {
    roots
        .iter()
        .any(|root| root == id || is_descendant_of(id, root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventType;
    use crate::store::MemoryStore;
    use crate::store::traits::*;

    #[tokio::test]
    async fn test_track_persists_in_background() {
        let store = Arc::new(MemoryStore::new());
        let background = BackgroundExecutor::new(4);
        let tracker = ActivityTracker::new(store.clone(), background.clone());

        tracker.track(ActivityEvent::new(
            EventType::CreatePackage,
            "acme",
            "alice",
            serde_json::json!({}),
        ));
        background.wait_idle().await;

        let events = store
            .list_events(EventQuery {
                package_ids: None,
                types: vec![],
                offset: 0,
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::CreatePackage);
    }

    #[test]
    fn test_subtree_membership() {
        let roots: BTreeSet<Id> = ["acme.pay".to_string()].into_iter().collect();
        assert!(in_subtree_of("acme.pay", &roots));
        assert!(in_subtree_of("acme.pay.gw", &roots));
        assert!(!in_subtree_of("acme.payments", &roots));
    }
}
