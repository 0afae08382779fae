use std::sync::Arc;
use std::time::Duration;

use apihub_catalog::error::codes;
use apihub_catalog::logic::BuildController;
use apihub_catalog::storage::{MemoryBucket, ObjectStorage, BUILD_RESULT_TABLE};
use apihub_catalog::store::BlobStore;
use apihub_catalog::{
    AppConfig, BuildConfig, BuildFormat, BuildType, Catalog, GroupOperationRef, GroupPublishRequest,
    GroupPublishStatus, MemoryStore, NewApiKey, NewOperationGroup, NewPackage, PackageKind, PackageLookup,
    PackagePatch, Permission, Principal, PublishRequest, VersionPatch, VersionStatus,
};
use serde_json::json;

const ADMIN: &str = "root@acme.io";

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.identity.admin_email = ADMIN.to_string();
    config.builds.workers = 1;
    config.builds.poll_interval_ms = 10;
    config.builds.await_ceiling_ms = 20;
    config
}

async fn catalog() -> Arc<Catalog<MemoryStore>> {
    let catalog = Arc::new(Catalog::new(Arc::new(MemoryStore::new()), test_config(), None));
    catalog.auth.bootstrap(&catalog.config.identity).await.unwrap();
    catalog
}

fn admin() -> Principal {
    Principal::user(ADMIN)
}

fn new_package(kind: PackageKind, parent_id: &str, alias: &str) -> NewPackage {
    NewPackage {
        kind: Some(kind),
        parent_id: parent_id.to_string(),
        alias: alias.to_string(),
        name: alias.to_string(),
        ..Default::default()
    }
}

fn gateway_release(version: &str) -> PublishRequest {
    serde_json::from_value(json!({
        "packageId": "acme.pay.gw",
        "version": version,
        "status": "draft",
        "files": [{
            "fileId": "openapi.json",
            "slug": "openapi",
            "title": "Gateway",
            "content": "{\"openapi\":\"3.0.0\",\"info\":{\"title\":\"Gateway\"}}"
        }],
        "operations": [
            {"operationId": "get-users", "title": "List users", "method": "get", "path": "/users", "documentSlug": "openapi"},
            {"operationId": "post-users", "title": "Create user", "method": "post", "path": "/users", "documentSlug": "openapi"},
            {"operationId": "get-orders", "title": "List orders", "method": "get", "path": "/orders", "documentSlug": "openapi"}
        ]
    }))
    .unwrap()
}

/// acme / acme.pay / acme.pay.gw (one draft) and acme.billing.
async fn workspace(catalog: &Catalog<MemoryStore>) {
    let admin = admin();
    catalog
        .packages
        .create_package(&admin, new_package(PackageKind::Workspace, "", "acme"))
        .await
        .unwrap();
    catalog
        .packages
        .create_package(&admin, new_package(PackageKind::Group, "acme", "pay"))
        .await
        .unwrap();
    catalog
        .packages
        .create_package(&admin, new_package(PackageKind::Package, "acme.pay", "gw"))
        .await
        .unwrap();
    catalog
        .packages
        .create_package(&admin, new_package(PackageKind::Package, "acme", "billing"))
        .await
        .unwrap();
    catalog.versions.publish(&admin, gateway_release("2025.1")).await.unwrap();
}

#[tokio::test]
async fn test_default_version_follows_release() {
    let catalog = catalog().await;
    workspace(&catalog).await;
    let admin = admin();

    assert_eq!(
        catalog.versions.get_default_version(&admin, "acme.pay.gw").await.unwrap(),
        Some("2025.1@1".to_string())
    );

    catalog
        .versions
        .patch_version(
            &admin,
            "acme.pay.gw",
            "2025.1",
            VersionPatch {
                status: Some(VersionStatus::Release),
                labels: None,
            },
        )
        .await
        .unwrap();
    let updated = catalog
        .packages
        .update_package(
            &admin,
            "acme.pay.gw",
            PackagePatch {
                default_release_version: Some("2025.1".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.default_release_version, "2025.1");
    assert_eq!(
        catalog.versions.get_default_version(&admin, "acme.pay.gw").await.unwrap(),
        Some("2025.1@1".to_string())
    );

    let err = catalog
        .packages
        .update_package(
            &admin,
            "acme.pay.gw",
            PackagePatch {
                default_release_version: Some("2031.4".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), codes::VERSION_NOT_FOUND);
}

#[tokio::test]
async fn test_inherited_membership() {
    let catalog = catalog().await;
    workspace(&catalog).await;
    let admin = admin();
    let bob = Principal::user("bob@acme.io");

    let before = catalog.auth.user_permissions(&bob, "acme.pay.gw").await.unwrap();
    assert!(before.contains(&Permission::Read.as_str().to_string()));
    assert!(!before.contains(&Permission::ManageReleaseVersion.as_str().to_string()));

    catalog
        .auth
        .add_members(&admin, "acme", &["bob@acme.io".to_string()], &["editor".to_string()])
        .await
        .unwrap();
    let after = catalog.auth.user_permissions(&bob, "acme.pay.gw").await.unwrap();
    assert!(after.contains(&"manage_release_version".to_string()));

    // the role lives on the workspace, not on the package
    let err = catalog
        .auth
        .delete_member(&admin, "acme.pay.gw", "bob@acme.io")
        .await
        .unwrap_err();
    assert_eq!(err.code(), codes::USER_WITH_NO_ROLES);

    catalog.auth.delete_member(&admin, "acme", "bob@acme.io").await.unwrap();
    let reverted = catalog.auth.user_permissions(&bob, "acme.pay.gw").await.unwrap();
    assert!(!reverted.contains(&"manage_release_version".to_string()));
}

#[tokio::test]
async fn test_api_key_scope() {
    let catalog = catalog().await;
    workspace(&catalog).await;

    let created = catalog
        .auth
        .create_api_key(
            &admin(),
            "acme.pay",
            NewApiKey {
                name: "ci".to_string(),
                roles: vec![],
                created_for: None,
            },
        )
        .await
        .unwrap();
    let key = catalog.auth.resolve_api_key(&created.api_key).await.unwrap();

    let found = catalog.packages.get_package(&key, "acme.pay.gw", false).await.unwrap();
    assert!(matches!(found, PackageLookup::Found(view) if view.package.id == "acme.pay.gw"));

    let err = catalog
        .packages
        .get_package(&key, "acme.billing", false)
        .await
        .unwrap_err();
    assert_eq!(err.code(), codes::INSUFFICIENT_PRIVILEGES);

    catalog
        .auth
        .revoke_api_key(&admin(), "acme.pay", &created.key.id)
        .await
        .unwrap();
    let err = catalog.auth.resolve_api_key(&created.api_key).await.unwrap_err();
    assert_eq!(err.code(), codes::UNAUTHENTICATED);
}

#[tokio::test]
async fn test_move_and_move_back() {
    let catalog = catalog().await;
    workspace(&catalog).await;
    let admin = admin();

    let forward = catalog
        .packages
        .move_package(&admin, "acme.pay", "acme.payments", false)
        .await
        .unwrap();
    assert_eq!(forward.to_id, "acme.payments");

    match catalog.packages.get_package(&admin, "acme.pay.gw", false).await.unwrap() {
        PackageLookup::Moved { to_id, .. } => assert_eq!(to_id, "acme.payments.gw"),
        PackageLookup::Found(_) => panic!("old id should redirect"),
    }
    assert_eq!(
        catalog.versions.get_default_version(&admin, "acme.payments.gw").await.unwrap(),
        Some("2025.1@1".to_string())
    );

    catalog
        .packages
        .move_package(&admin, "acme.payments", "acme.pay", false)
        .await
        .unwrap();
    assert!(matches!(
        catalog.packages.get_package(&admin, "acme.pay", false).await.unwrap(),
        PackageLookup::Found(_)
    ));
    assert!(matches!(
        catalog.packages.get_package(&admin, "acme.payments", false).await.unwrap(),
        PackageLookup::Moved { .. }
    ));

    let transitions = catalog.packages.list_transitions("acme.pay").await.unwrap();
    assert!(transitions
        .iter()
        .any(|t| t.from_id == "acme.pay" && t.to_id == "acme.payments"));
    assert!(transitions
        .iter()
        .any(|t| t.from_id == "acme.payments" && t.to_id == "acme.pay"));
}

#[tokio::test]
async fn test_group_publish_end_to_end() {
    let catalog = catalog().await;
    workspace(&catalog).await;
    let admin = admin();
    catalog
        .packages
        .create_package(&admin, new_package(PackageKind::Package, "acme.pay", "users"))
        .await
        .unwrap();
    let handles = catalog.start().unwrap();

    let operations = ["get-users", "post-users", "get-orders"]
        .iter()
        .map(|id| GroupOperationRef {
            operation_id: id.to_string(),
            package_id: None,
            version: None,
        })
        .collect();
    let group = catalog
        .groups
        .create_group(
            &admin,
            "acme.pay.gw",
            "2025.1",
            "rest",
            NewOperationGroup {
                group_name: "public".to_string(),
                description: "Public surface".to_string(),
                template: None,
                operations: Some(operations),
            },
        )
        .await
        .unwrap();
    assert_eq!(group.operations_count, 3);

    for version in ["1.0", "1.1"] {
        let started = catalog
            .groups
            .publish_group(
                &admin,
                "acme.pay.gw",
                "2025.1",
                "rest",
                "public",
                GroupPublishRequest {
                    package_id: "acme.pay.users".to_string(),
                    version: version.to_string(),
                    status: VersionStatus::Draft,
                    previous_version: None,
                    previous_version_package_id: None,
                    labels: vec![],
                },
            )
            .await
            .unwrap();
        assert_eq!(started.status, GroupPublishStatus::Running);

        let mut status = started.status;
        for _ in 0..500 {
            status = catalog
                .groups
                .get_publish_status(&admin, &started.publish_id)
                .await
                .unwrap()
                .status;
            if status != GroupPublishStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, GroupPublishStatus::Complete);
    }

    let documents = catalog
        .versions
        .list_documents(&admin, "acme.pay.users", "1.0")
        .await
        .unwrap();
    assert_eq!(documents.len(), 3);
    assert_eq!(catalog.cache.len().await, 1);

    catalog.shutdown(handles, Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_build_results_move_into_bucket() {
    let store = Arc::new(MemoryStore::new());
    let config = Arc::new(test_config());
    let rows = BuildController::new(store.clone(), Arc::new(ObjectStorage::new(store.clone())), config.clone());

    let mut build_ids = Vec::new();
    for i in 0..10 {
        let build_config = BuildConfig::new("acme.gw", &format!("1.{}", i), BuildType::ExportVersion, BuildFormat::Json);
        let id = rows.create_build(build_config.clone()).await.unwrap();
        rows.store_export_result("root", &id, format!("result-{}", i).as_bytes(), "gw.zip", &build_config)
            .await
            .unwrap();
        build_ids.push(id);
    }

    let bucket = Arc::new(MemoryBucket::new());
    let storage = Arc::new(ObjectStorage::with_bucket(store.clone(), bucket.clone(), false));
    let report = storage.upload_files_to_bucket(BUILD_RESULT_TABLE).await.unwrap();
    assert_eq!(report.moved, 10);
    assert!(report.error.is_none());
    assert!(store.list_blob_ids(BUILD_RESULT_TABLE, 0, 100).await.unwrap().is_empty());

    let bucketed = BuildController::new(store.clone(), storage, config);
    for (i, id) in build_ids.iter().enumerate() {
        assert!(bucket.contains(&format!("build-result/{}.zip", id)).await);
        let (_, result) = bucketed.get_export_result(id).await.unwrap();
        assert_eq!(result.unwrap().data, format!("result-{}", i).into_bytes());
    }
}
