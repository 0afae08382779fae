use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{codes, CatalogError, CatalogResult};
use crate::logic::authorization::Authorization;
use crate::logic::versions::resolve_revision;
use crate::model::{
    comparison_id, ApiKind, ChangeAction, ChangelogFilter, Operation, OperationChange,
    OperationChangeView, Permission, Principal, Revision, Severity, VersionComparison,
};
use crate::store::traits::Store;

/// Classify operation-level differences between two revisions.
///
/// Removed operations are breaking and added ones non-breaking. A newly
/// deprecated operation is reported as deprecated; any other content change
/// is semi-breaking for backward-compatible APIs and unclassified otherwise.
pub fn compare_operations(previous: &[Operation], current: &[Operation]) -> Vec<OperationChange> {
    let key = |op: &Operation| (op.api_type.clone(), op.operation_id.clone());
    let before: BTreeMap<_, _> = previous.iter().map(|op| (key(op), op)).collect();
    let after: BTreeMap<_, _> = current.iter().map(|op| (key(op), op)).collect();
    let mut changes = Vec::new();

    for (k, old) in &before {
        if !after.contains_key(k) {
            changes.push(change(old, ChangeAction::Remove, Severity::Breaking, "removed"));
        }
    }
    for (k, new) in &after {
        match before.get(k) {
            None => changes.push(change(new, ChangeAction::Add, Severity::NonBreaking, "added")),
            Some(old) if !old.deprecated && new.deprecated => {
                changes.push(change(new, ChangeAction::Change, Severity::Deprecated, "deprecated"))
            }
            Some(old) if old.data_hash != new.data_hash => {
                let severity = if new.api_kind == ApiKind::Bwc {
                    Severity::SemiBreaking
                } else {
                    Severity::Unclassified
                };
                let mut c = change(new, ChangeAction::Change, severity, "changed");
                if severity == Severity::SemiBreaking {
                    c.title = format!("Semi-Breaking change in {}", display_title(new));
                }
                changes.push(c);
            }
            Some(_) => {}
        }
    }
    changes
}

fn display_title(op: &Operation) -> &str {
    if op.title.is_empty() {
        &op.operation_id
    } else {
        &op.title
    }
}

fn change(op: &Operation, action: ChangeAction, severity: Severity, verb: &str) -> OperationChange {
    OperationChange {
        api_type: op.api_type.clone(),
        operation_id: op.operation_id.clone(),
        previous_operation_id: match action {
            ChangeAction::Add => None,
            _ => Some(op.operation_id.clone()),
        },
        action,
        severity,
        title: format!("Operation {} {}", display_title(op), verb),
        description: match (&op.method, &op.path) {
            (Some(method), Some(path)) => format!("{} {}", method.to_uppercase(), path),
            _ => String::new(),
        },
        api_kind: op.api_kind.clone(),
        tags: op.tags.clone(),
    }
}

/// Revision a new one is compared against: the declared previous version,
/// else the prior revision of the same version.
pub async fn previous_revision_of<S: Store>(store: &S, revision: &Revision) -> CatalogResult<Option<Revision>> {
    if let Some(previous_version) = revision.previous_version.as_deref().filter(|v| !v.is_empty()) {
        let package_id = revision
            .previous_version_package_id
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(&revision.package_id);
        return match resolve_revision(store, package_id, previous_version).await {
            Ok(previous) => Ok(Some(previous)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        };
    }
    if revision.revision <= 1 {
        return Ok(None);
    }
    Ok(store
        .list_revisions(&revision.package_id, &revision.version)
        .await?
        .into_iter()
        .filter(|r| r.revision < revision.revision)
        .max_by_key(|r| r.revision))
}

/// `(exists, noContent)` of a stored comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonExists {
    pub exists: bool,
    pub no_content: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonSummary {
    pub comparison_id: String,
    pub package_id: String,
    pub version: String,
    pub previous_package_id: String,
    pub previous_version: String,
    pub no_content: bool,
    /// api type -> wire severity name -> count
    pub operation_types: BTreeMap<String, BTreeMap<String, usize>>,
}

pub struct ComparisonService<S: Store> {
    store: Arc<S>,
    auth: Authorization<S>,
}

impl<S: Store> Clone for ComparisonService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            auth: self.auth.clone(),
        }
    }
}

impl<S: Store + 'static> ComparisonService<S> {
    pub fn new(store: Arc<S>, auth: Authorization<S>) -> Self {
        Self { store, auth }
    }

    async fn sides(
        &self,
        principal: &Principal,
        package_id: &str,
        version: &str,
        previous_package_id: Option<&str>,
        previous_version: Option<&str>,
    ) -> CatalogResult<(Revision, Revision)> {
        self.auth.check_package(principal, package_id, Permission::Read).await?;
        let current = resolve_revision(self.store.as_ref(), package_id, version).await?;
        let previous = match previous_version.filter(|v| !v.is_empty()) {
            Some(previous_version) => {
                let previous_package = previous_package_id.filter(|p| !p.is_empty()).unwrap_or(package_id);
                self.auth
                    .check_package(principal, previous_package, Permission::Read)
                    .await?;
                resolve_revision(self.store.as_ref(), previous_package, previous_version).await?
            }
            None => previous_revision_of(self.store.as_ref(), &current)
                .await?
                .ok_or_else(|| comparison_not_found(&current.key()))?,
        };
        Ok((current, previous))
    }

    async fn load(&self, current: &Revision, previous: &Revision) -> CatalogResult<Option<VersionComparison>> {
        let id = comparison_id(
            &current.package_id,
            &current.version,
            current.revision,
            &previous.package_id,
            &previous.version,
            previous.revision,
        );
        Ok(self.store.get_comparison(&id).await?)
    }

    pub async fn compare_exists(
        &self,
        principal: &Principal,
        package_id: &str,
        version: &str,
        previous_package_id: Option<&str>,
        previous_version: Option<&str>,
    ) -> CatalogResult<ComparisonExists> {
        let (current, previous) = self
            .sides(principal, package_id, version, previous_package_id, previous_version)
            .await?;
        Ok(match self.load(&current, &previous).await? {
            Some(comparison) => ComparisonExists {
                exists: true,
                no_content: comparison.no_content,
            },
            None => ComparisonExists {
                exists: false,
                no_content: false,
            },
        })
    }

    pub async fn summary(
        &self,
        principal: &Principal,
        package_id: &str,
        version: &str,
        previous_package_id: Option<&str>,
        previous_version: Option<&str>,
    ) -> CatalogResult<ComparisonSummary> {
        let (current, previous) = self
            .sides(principal, package_id, version, previous_package_id, previous_version)
            .await?;
        let comparison = self
            .load(&current, &previous)
            .await?
            .ok_or_else(|| comparison_not_found(&current.key()))?;
        let operation_types = comparison
            .summary_by_api_type()
            .into_iter()
            .map(|(api_type, counts)| {
                let counts = Severity::ALL
                    .iter()
                    .map(|s| (s.wire_name().to_string(), counts.get(s).copied().unwrap_or(0)))
                    .collect();
                (api_type, counts)
            })
            .collect();
        Ok(ComparisonSummary {
            comparison_id: comparison.comparison_id,
            package_id: current.package_id.clone(),
            version: current.key(),
            previous_package_id: previous.package_id.clone(),
            previous_version: previous.key(),
            no_content: comparison.no_content,
            operation_types,
        })
    }

    /// Changes of a stored comparison with the `risky` projection applied.
    pub async fn changelog(
        &self,
        principal: &Principal,
        comparison_id: &str,
        filter: &ChangelogFilter,
    ) -> CatalogResult<Vec<OperationChangeView>> {
        let comparison = self
            .store
            .get_comparison(comparison_id)
            .await?
            .ok_or_else(|| comparison_not_found(comparison_id))?;
        self.auth
            .check_package(principal, &comparison.package_id, Permission::Read)
            .await?;
        if comparison.previous_package_id != comparison.package_id {
            self.auth
                .check_package(principal, &comparison.previous_package_id, Permission::Read)
                .await?;
        }

        let mut severities = BTreeSet::new();
        for raw in &filter.severities {
            let severity = Severity::parse(raw).ok_or_else(|| {
                CatalogError::validation(codes::INVALID_PARAMETER, format!("Unknown severity '{}'", raw))
                    .with_param("severity", raw)
            })?;
            severities.insert(severity);
        }
        let (group_members, grouped) = self.group_membership(&comparison, filter).await?;
        let text = filter.text_filter.as_deref().map(str::to_lowercase);

        let changes: Vec<&OperationChange> = comparison
            .changes
            .iter()
            .filter(|c| filter.api_type.as_deref().map(|t| c.api_type == t).unwrap_or(true))
            .filter(|c| severities.is_empty() || severities.contains(&c.severity))
            .filter(|c| filter.tag.as_ref().map(|t| c.tags.contains(t)).unwrap_or(true))
            .filter(|c| !filter.empty_tag || c.tags.is_empty())
            .filter(|c| {
                filter
                    .api_kind
                    .as_deref()
                    .map(|k| c.api_kind.as_str() == k)
                    .unwrap_or(true)
            })
            .filter(|c| {
                text.as_ref()
                    .map(|t| {
                        c.title.to_lowercase().contains(t) || c.operation_id.to_lowercase().contains(t)
                    })
                    .unwrap_or(true)
            })
            .filter(|c| {
                group_members
                    .as_ref()
                    .map(|members| members.contains(&c.operation_id))
                    .unwrap_or(true)
            })
            .filter(|c| !filter.empty_group || !grouped.contains(&c.operation_id))
            .collect();
        Ok(filter
            .paging
            .apply(changes)
            .into_iter()
            .map(OperationChangeView::from)
            .collect())
    }

    /// Members of the requested group, and every grouped operation of the
    /// compared revision.
    async fn group_membership(
        &self,
        comparison: &VersionComparison,
        filter: &ChangelogFilter,
    ) -> CatalogResult<(Option<BTreeSet<String>>, BTreeSet<String>)> {
        if filter.group.is_none() && !filter.empty_group {
            return Ok((None, BTreeSet::new()));
        }
        let groups = self
            .store
            .list_groups(&comparison.package_id, &comparison.version, comparison.revision)
            .await?;
        let mut selected = filter.group.as_ref().map(|_| BTreeSet::new());
        let mut grouped = BTreeSet::new();
        for group in groups {
            if filter.api_type.as_deref().map(|t| group.api_type != t).unwrap_or(false) {
                continue;
            }
            let members = self.store.list_grouped_operations(&group.group_id).await?;
            if let (Some(selected), Some(name)) = (selected.as_mut(), filter.group.as_ref()) {
                if &group.group_name == name {
                    selected.extend(members.iter().map(|m| m.operation_id.clone()));
                }
            }
            grouped.extend(members.into_iter().map(|m| m.operation_id));
        }
        Ok((selected, grouped))
    }
}

fn comparison_not_found(id: &str) -> CatalogError {
    CatalogError::not_found(
        codes::COMPARISON_NOT_FOUND,
        format!("Comparison for '{}' not found", id),
    )
    .with_param("id", id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewOperation;

    fn op(id: &str, kind: &str, deprecated: bool, path: &str) -> Operation {
        let mut new: NewOperation = serde_json::from_value(serde_json::json!({
            "operationId": id,
            "title": id,
            "method": "get",
            "path": path,
            "apiKind": kind,
        }))
        .unwrap();
        new.deprecated = deprecated;
        new.into_operation("acme.pay.gw", "2025.1", 1)
    }

    #[test]
    fn test_heuristics() {
        let before = vec![
            op("gone", "bwc", false, "/gone"),
            op("stable", "bwc", false, "/stable"),
            op("moved", "bwc", false, "/v1/moved"),
            op("beta", "experimental", false, "/v1/beta"),
            op("old", "bwc", false, "/old"),
        ];
        let after = vec![
            op("stable", "bwc", false, "/stable"),
            op("moved", "bwc", false, "/v2/moved"),
            op("beta", "experimental", false, "/v2/beta"),
            op("old", "bwc", true, "/old"),
            op("fresh", "bwc", false, "/fresh"),
        ];
        let changes = compare_operations(&before, &after);
        let severity = |id: &str| {
            changes
                .iter()
                .find(|c| c.operation_id == id)
                .map(|c| c.severity)
        };
        assert_eq!(changes.len(), 5);
        assert_eq!(severity("gone"), Some(Severity::Breaking));
        assert_eq!(severity("fresh"), Some(Severity::NonBreaking));
        assert_eq!(severity("old"), Some(Severity::Deprecated));
        assert_eq!(severity("moved"), Some(Severity::SemiBreaking));
        assert_eq!(severity("beta"), Some(Severity::Unclassified));
        assert_eq!(severity("stable"), None);

        let moved = changes.iter().find(|c| c.operation_id == "moved").unwrap();
        assert_eq!(OperationChangeView::from(moved).title, "Risky change in moved");
    }

    #[test]
    fn test_identical_revisions_have_no_content() {
        let ops = vec![op("stable", "bwc", false, "/stable")];
        assert!(compare_operations(&ops, &ops).is_empty());
    }
}
