use std::sync::Arc;

use apihub_catalog::{create_app, AppConfig, Catalog, MemoryStore, NewApiKey, Principal};
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

const ADMIN: &str = "root@acme.io";

// Test client wrapper driving the router in-process
struct TestClient {
    app: Router,
    user: Option<String>,
    api_key: Option<String>,
}

impl TestClient {
    fn new(app: Router) -> Self {
        Self {
            app,
            user: None,
            api_key: None,
        }
    }

    fn as_user(&self, user: &str) -> Self {
        Self {
            app: self.app.clone(),
            user: Some(user.to_string()),
            api_key: None,
        }
    }

    fn with_api_key(&self, api_key: &str) -> Self {
        Self {
            app: self.app.clone(),
            user: None,
            api_key: Some(api_key.to_string()),
        }
    }

    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value, Option<String>) {
        let mut request = Request::builder().method(method).uri(path);
        if let Some(user) = &self.user {
            request = request.header("x-user-id", user);
        }
        if let Some(api_key) = &self.api_key {
            request = request.header("api-key", api_key);
        }
        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let location = response
            .headers()
            .get(header::LOCATION)
            .map(|v| v.to_str().unwrap().to_string());
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json, location)
    }

    async fn get(&self, path: &str) -> (StatusCode, Value, Option<String>) {
        self.send(Method::GET, path, None).await
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value, Option<String>) {
        self.send(Method::POST, path, Some(body)).await
    }

    async fn patch(&self, path: &str, body: Value) -> (StatusCode, Value, Option<String>) {
        self.send(Method::PATCH, path, Some(body)).await
    }
}

async fn setup() -> (Arc<Catalog<MemoryStore>>, TestClient) {
    let mut config = AppConfig::default();
    config.identity.admin_email = ADMIN.to_string();
    let catalog = Arc::new(Catalog::new(Arc::new(MemoryStore::new()), config, None));
    catalog.auth.bootstrap(&catalog.config.identity).await.unwrap();
    let client = TestClient::new(create_app(catalog.clone()));
    (catalog, client)
}

async fn create_tree(client: &TestClient) {
    let (status, body, _) = client
        .post("/api/v2/packages", json!({"kind": "workspace", "alias": "acme", "name": "Acme"}))
        .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    let (status, _, _) = client
        .post("/api/v2/packages", json!({"kind": "group", "parentId": "acme", "alias": "pay"}))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _, _) = client
        .post("/api/v2/packages", json!({"kind": "package", "parentId": "acme.pay", "alias": "gw"}))
        .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_health_and_unknown_route() {
    let (_, client) = setup().await;
    let (status, body, _) = client.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body, _) = client.as_user(ADMIN).get("/api/v2/nowhere").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], 404);
}

#[tokio::test]
async fn test_requests_without_identity_are_rejected() {
    let (_, client) = setup().await;
    let (status, body, _) = client.get("/api/v2/packages").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "Unauthenticated");
}

#[tokio::test]
async fn test_package_crud_and_error_envelope() {
    let (_, client) = setup().await;
    let admin = client.as_user(ADMIN);
    create_tree(&admin).await;

    let (status, body, _) = admin.get("/api/v2/packages/acme.pay.gw?showParents=true").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "acme.pay.gw");
    assert_eq!(body["parents"].as_array().unwrap().len(), 2);

    let (status, body, _) = admin
        .patch("/api/v2/packages/acme.pay.gw", json!({"description": "Payment gateway"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["description"], "Payment gateway");

    let (status, body, _) = admin.patch("/api/v2/packages/acme.pay.gw", json!({"kind": "group"})).await;
    assert!(status.is_client_error(), "{}", body);

    let (status, body, _) = admin.get("/api/v2/packages/acme.missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "PackageNotFound");
    assert_eq!(body["params"]["id"], "acme.missing");

    let (status, body, _) = admin.get("/api/v2/packages?parentId=acme&showAllDescendants=true&limit=10").await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    let (status, body, _) = admin.get("/api/v1/packages/acme.pay.gw").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["packageId"], "acme.pay.gw");
}

#[tokio::test]
async fn test_moved_package_redirects() {
    let (_, client) = setup().await;
    let admin = client.as_user(ADMIN);
    create_tree(&admin).await;

    let (status, _, _) = admin
        .post(
            "/api/v2/packages/move",
            json!({"from": "acme.pay", "to": "acme.payments", "overwriteHistory": false}),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body, location) = admin.get("/api/v2/packages/acme.pay.gw").await;
    assert_eq!(status, StatusCode::MOVED_PERMANENTLY);
    assert_eq!(body["toId"], "acme.payments.gw");
    assert_eq!(location.as_deref(), Some("/api/v2/packages/acme.payments.gw"));
}

#[tokio::test]
async fn test_api_key_header() {
    let (catalog, client) = setup().await;
    let admin = client.as_user(ADMIN);
    create_tree(&admin).await;
    let (status, _, _) = admin
        .post("/api/v2/packages", json!({"kind": "package", "parentId": "acme", "alias": "billing"}))
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let created = catalog
        .auth
        .create_api_key(
            &Principal::user(ADMIN),
            "acme.pay",
            NewApiKey {
                name: "ci".to_string(),
                roles: vec![],
                created_for: None,
            },
        )
        .await
        .unwrap();
    let key = client.with_api_key(&created.api_key);

    let (status, _, _) = key.get("/api/v2/packages/acme.pay.gw").await;
    assert_eq!(status, StatusCode::OK);
    let (status, body, _) = key.get("/api/v2/packages/acme.billing").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "InsufficientPrivileges");

    let (status, _, _) = client.with_api_key("not-a-key").get("/api/v2/packages/acme").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
