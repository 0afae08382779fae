use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{codes, CatalogError, CatalogResult};
use crate::logic::authorization::Authorization;
use crate::logic::versions::resolve_revision;
use crate::model::{
    Operation, OperationKey, OperationListFilter, Paging, Permission, Principal, Revision,
    TextFilter,
};
use crate::store::traits::Store;

pub struct OperationService<S: Store> {
    store: Arc<S>,
    auth: Authorization<S>,
}

impl<S: Store> Clone for OperationService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            auth: self.auth.clone(),
        }
    }
}

impl<S: Store + 'static> OperationService<S> {
    pub fn new(store: Arc<S>, auth: Authorization<S>) -> Self {
        Self { store, auth }
    }

    async fn revision(&self, principal: &Principal, package_id: &str, version: &str) -> CatalogResult<Revision> {
        self.auth.check_package(principal, package_id, Permission::Read).await?;
        resolve_revision(self.store.as_ref(), package_id, version).await
    }

    /// Operations of the revision plus those of its non-excluded references.
    async fn collect(&self, revision: &Revision, skip_refs: bool) -> CatalogResult<Vec<Operation>> {
        let mut operations = self
            .store
            .list_operations(&revision.package_id, &revision.version, revision.revision)
            .await?;
        if !skip_refs {
            let references = self
                .store
                .list_references(&revision.package_id, &revision.version, revision.revision)
                .await?;
            for reference in references.into_iter().filter(|r| !r.excluded) {
                operations.extend(
                    self.store
                        .list_operations(&reference.ref_package_id, &reference.ref_version, reference.ref_revision)
                        .await?,
                );
            }
        }
        Ok(operations)
    }

    /// group name -> members, restricted to one api type when given.
    async fn groups_of(
        &self,
        revision: &Revision,
        api_type: Option<&str>,
    ) -> CatalogResult<BTreeMap<String, BTreeSet<(String, String)>>> {
        let mut out = BTreeMap::new();
        for group in self
            .store
            .list_groups(&revision.package_id, &revision.version, revision.revision)
            .await?
        {
            if api_type.map(|t| t != group.api_type).unwrap_or(false) {
                continue;
            }
            let members = self
                .store
                .list_grouped_operations(&group.group_id)
                .await?
                .into_iter()
                .map(|m| (m.package_id, m.operation_id))
                .collect();
            out.insert(group.group_name, members);
        }
        Ok(out)
    }

    pub async fn list_operations(
        &self,
        principal: &Principal,
        package_id: &str,
        version: &str,
        filter: &OperationListFilter,
    ) -> CatalogResult<Vec<Operation>> {
        let revision = self.revision(principal, package_id, version).await?;
        let operations = self.collect(&revision, filter.skip_refs).await?;
        let text = filter.text_filter.as_deref().and_then(TextFilter::parse);

        let groups = if filter.group.is_some() || filter.empty_group {
            self.groups_of(&revision, filter.api_type.as_deref()).await?
        } else {
            BTreeMap::new()
        };
        let selected_group = match filter.group.as_ref() {
            Some(name) => Some(
                groups
                    .get(name)
                    .cloned()
                    .ok_or_else(|| CatalogError::group_not_found(name))?,
            ),
            None => None,
        };
        let grouped: BTreeSet<(String, String)> = groups.values().flatten().cloned().collect();

        let mut matched: Vec<Operation> = operations
            .into_iter()
            .filter(|op| filter.api_type.as_deref().map(|t| op.api_type == t).unwrap_or(true))
            .filter(|op| filter.kind.as_deref().map(|k| op.api_kind.as_str() == k).unwrap_or(true))
            .filter(|op| filter.tag.as_ref().map(|t| op.tags.contains(t)).unwrap_or(true))
            .filter(|op| !filter.empty_tag || op.tags.is_empty())
            .filter(|op| {
                filter
                    .api_audience
                    .as_deref()
                    .map(|a| a == "all" || op.api_audience == a)
                    .unwrap_or(true)
            })
            .filter(|op| filter.deprecated.map(|d| op.deprecated == d).unwrap_or(true))
            .filter(|op| {
                filter
                    .document_slug
                    .as_deref()
                    .map(|s| op.document_slug == s)
                    .unwrap_or(true)
            })
            .filter(|op| filter.ids.is_empty() || filter.ids.contains(&op.operation_id))
            .filter(|op| text.as_ref().map(|t| t.matches(op)).unwrap_or(true))
            .filter(|op| {
                let key = (op.package_id.clone(), op.operation_id.clone());
                selected_group.as_ref().map(|g| g.contains(&key)).unwrap_or(true)
                    && (!filter.empty_group || !grouped.contains(&key))
            })
            .collect();
        matched.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(filter.paging.apply(matched))
    }

    pub async fn get_operation(
        &self,
        principal: &Principal,
        package_id: &str,
        version: &str,
        api_type: &str,
        operation_id: &str,
    ) -> CatalogResult<Operation> {
        let revision = self.revision(principal, package_id, version).await?;
        self.store
            .get_operation(package_id, &revision.version, revision.revision, api_type, operation_id)
            .await?
            .ok_or_else(|| operation_not_found(operation_id, &revision.key()))
    }

    /// Distinct tags, optionally narrowed by a substring.
    pub async fn list_tags(
        &self,
        principal: &Principal,
        package_id: &str,
        version: &str,
        api_type: Option<&str>,
        text_filter: Option<&str>,
        paging: Paging,
    ) -> CatalogResult<Vec<String>> {
        let revision = self.revision(principal, package_id, version).await?;
        let text = text_filter.map(str::to_lowercase);
        let tags: BTreeSet<String> = self
            .collect(&revision, false)
            .await?
            .into_iter()
            .filter(|op| api_type.map(|t| op.api_type == t).unwrap_or(true))
            .flat_map(|op| op.tags)
            .filter(|tag| text.as_ref().map(|t| tag.to_lowercase().contains(t)).unwrap_or(true))
            .collect();
        Ok(paging.apply(tags.into_iter().collect()))
    }

    pub async fn deprecated_operations(
        &self,
        principal: &Principal,
        package_id: &str,
        version: &str,
        filter: &OperationListFilter,
    ) -> CatalogResult<Vec<Operation>> {
        let filter = OperationListFilter {
            deprecated: Some(true),
            ..filter.clone()
        };
        self.list_operations(principal, package_id, version, &filter).await
    }

    /// Operations of the same revision referencing the model declared on the
    /// pivot operation with the same content hash.
    pub async fn model_usages(
        &self,
        principal: &Principal,
        package_id: &str,
        version: &str,
        api_type: &str,
        operation_id: &str,
        model_name: &str,
    ) -> CatalogResult<Vec<OperationKey>> {
        let pivot = self
            .get_operation(principal, package_id, version, api_type, operation_id)
            .await?;
        let hash = pivot.models.get(model_name).ok_or_else(|| {
            CatalogError::not_found(
                codes::MODEL_NOT_FOUND,
                format!("Model '{}' is not used by operation '{}'", model_name, operation_id),
            )
            .with_param("model", model_name)
            .with_param("operationId", operation_id)
        })?;
        let mut usages: Vec<OperationKey> = self
            .store
            .list_operations(&pivot.package_id, &pivot.version, pivot.revision)
            .await?
            .into_iter()
            .filter(|op| op.api_type == api_type && op.models.get(model_name) == Some(hash))
            .map(|op| op.key())
            .collect();
        usages.sort();
        Ok(usages)
    }
}

fn operation_not_found(operation_id: &str, version: &str) -> CatalogError {
    CatalogError::not_found(
        codes::OPERATION_NOT_FOUND,
        format!("Operation '{}' not found in {}", operation_id, version),
    )
    .with_param("operationId", operation_id)
    .with_param("version", version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::activity::ActivityTracker;
    use crate::logic::background::BackgroundExecutor;
    use crate::model::{NewOperation, Package, PackageKind, VersionReference, VersionStatus};
    use crate::store::traits::NewRevision;
    use crate::store::MemoryStore;
    use crate::store::traits::*;
    use chrono::Utc;

    fn package(id: &str, kind: PackageKind) -> Package {
        Package {
            id: id.to_string(),
            kind,
            parent_id: crate::model::parent_of(id).to_string(),
            alias: crate::model::alias_of(id).to_string(),
            name: id.to_string(),
            description: String::new(),
            default_role: "viewer".to_string(),
            default_release_version: String::new(),
            release_version_pattern: String::new(),
            service_name: String::new(),
            rest_grouping_prefix: String::new(),
            exclude_from_search: false,
            image_url: String::new(),
            created_at: Utc::now(),
            created_by: "root".to_string(),
            deleted_at: None,
            deleted_by: None,
        }
    }

    fn op(package_id: &str, value: serde_json::Value) -> Operation {
        serde_json::from_value::<NewOperation>(value)
            .unwrap()
            .into_operation(package_id, "2025.1", 1)
    }

    async fn publish(store: &MemoryStore, package_id: &str, operations: Vec<Operation>, references: Vec<VersionReference>) {
        store
            .insert_revision(NewRevision {
                revision: Revision {
                    package_id: package_id.to_string(),
                    version: "2025.1".to_string(),
                    revision: 0,
                    status: VersionStatus::Draft,
                    previous_version: None,
                    previous_version_package_id: None,
                    labels: vec![],
                    published_at: Utc::now(),
                    created_by: "root".to_string(),
                    publish_id: None,
                    deleted_at: None,
                    deleted_by: None,
                },
                documents: vec![],
                operations,
                references,
            })
            .await
            .unwrap();
    }

    async fn service() -> OperationService<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.insert_package(package("acme", PackageKind::Workspace)).await.unwrap();
        store.insert_package(package("acme.gw", PackageKind::Package)).await.unwrap();
        store.insert_package(package("acme.dash", PackageKind::Dashboard)).await.unwrap();
        publish(
            &store,
            "acme.gw",
            vec![
                op("acme.gw", serde_json::json!({
                    "operationId": "get-users", "title": "Get Users", "path": "/users",
                    "tags": ["users"], "models": {"User": "h1"},
                    "customTags": {"x-team": "payments"}
                })),
                op("acme.gw", serde_json::json!({
                    "operationId": "get-user", "title": "Get User", "path": "/users/{id}",
                    "tags": ["users"], "models": {"User": "h1"}, "deprecated": true
                })),
                op("acme.gw", serde_json::json!({
                    "operationId": "list-orders", "title": "List Orders", "path": "/orders",
                    "models": {"User": "h2"}
                })),
            ],
            vec![],
        )
        .await;
        publish(
            &store,
            "acme.dash",
            vec![],
            vec![VersionReference {
                package_id: "acme.dash".to_string(),
                version: "2025.1".to_string(),
                revision: 0,
                ref_package_id: "acme.gw".to_string(),
                ref_version: "2025.1".to_string(),
                ref_revision: 1,
                excluded: false,
            }],
        )
        .await;
        let activity = ActivityTracker::new(store.clone(), BackgroundExecutor::new(1));
        OperationService::new(store.clone(), Authorization::new(store, activity))
    }

    #[tokio::test]
    async fn test_filters() {
        let ops = service().await;
        let viewer = Principal::user("viewer");
        let list = |filter: OperationListFilter| {
            let ops = ops.clone();
            let viewer = viewer.clone();
            async move {
                ops.list_operations(&viewer, "acme.gw", "2025.1", &filter)
                    .await
                    .unwrap()
                    .into_iter()
                    .map(|o| o.operation_id)
                    .collect::<Vec<_>>()
            }
        };
        assert_eq!(list(OperationListFilter::default()).await.len(), 3);
        assert_eq!(
            list(OperationListFilter {
                empty_tag: true,
                ..Default::default()
            })
            .await,
            vec!["list-orders"]
        );
        assert_eq!(
            list(OperationListFilter {
                text_filter: Some("x-team: payments".to_string()),
                ..Default::default()
            })
            .await,
            vec!["get-users"]
        );
        let deprecated = ops
            .deprecated_operations(&viewer, "acme.gw", "2025.1", &OperationListFilter::default())
            .await
            .unwrap();
        assert_eq!(deprecated.len(), 1);
        assert_eq!(deprecated[0].operation_id, "get-user");
    }

    #[tokio::test]
    async fn test_references_are_included_unless_skipped() {
        let ops = service().await;
        let viewer = Principal::user("viewer");
        let all = ops
            .list_operations(&viewer, "acme.dash", "2025.1", &OperationListFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        let own = ops
            .list_operations(
                &viewer,
                "acme.dash",
                "2025.1",
                &OperationListFilter {
                    skip_refs: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(own.is_empty());
    }

    #[tokio::test]
    async fn test_model_usages_and_tags() {
        let ops = service().await;
        let viewer = Principal::user("viewer");
        let usages = ops
            .model_usages(&viewer, "acme.gw", "2025.1", "rest", "get-users", "User")
            .await
            .unwrap();
        assert_eq!(
            usages.iter().map(|k| k.operation_id.as_str()).collect::<Vec<_>>(),
            vec!["get-user", "get-users"]
        );
        let err = ops
            .model_usages(&viewer, "acme.gw", "2025.1", "rest", "get-users", "Order")
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::MODEL_NOT_FOUND);

        let tags = ops
            .list_tags(&viewer, "acme.dash", "2025.1", None, None, Paging::default())
            .await
            .unwrap();
        assert_eq!(tags, vec!["users".to_string()]);
        let err = ops
            .get_operation(&viewer, "acme.gw", "2025.1", "rest", "missing")
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::OPERATION_NOT_FOUND);
    }
}
