use axum::{
    http::{HeaderName, HeaderValue, Method},
    routing::{get, post, put},
    Router,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::api::error::set_debug_errors;
use crate::api::handlers::AppState;
use crate::api::{auth_handlers, export_handlers, handlers, operation_handlers};
use crate::store::traits::Store;

const VERSION: &str = "/packages/:package_id/versions/:version";
const API_TYPE: &str = "/packages/:package_id/versions/:version/:api_type";
const GROUP: &str = "/packages/:package_id/versions/:version/:api_type/groups/:group_name";

fn at(prefix: &str, rest: &str) -> String {
    format!("{}{}", prefix, rest)
}

pub fn create_router<S: Store + 'static>() -> Router<AppState<S>> {
    Router::new()
        // Packages
        .route(
            "/packages",
            get(handlers::list_packages::<S>).post(handlers::create_package::<S>),
        )
        .route("/packages/move", post(handlers::move_package::<S>))
        .route("/packages/move/:move_id", get(handlers::get_move_status::<S>))
        .route("/packages/private", post(handlers::create_private_workspace::<S>))
        .route(
            "/packages/:package_id",
            get(handlers::get_package::<S>)
                .patch(handlers::update_package::<S>)
                .delete(handlers::delete_package::<S>),
        )
        .route(
            "/packages/:package_id/favor",
            post(handlers::favor_package::<S>).delete(handlers::disfavor_package::<S>),
        )
        .route("/packages/:package_id/transitions", get(handlers::list_transitions::<S>))
        .route("/packages/:package_id/defaultVersion", get(handlers::get_default_version::<S>))
        .route("/packages/:package_id/activity", get(handlers::package_activity::<S>))
        .route("/packages/:package_id/labels", get(handlers::list_labels::<S>))
        // Access control
        .route("/packages/:package_id/permissions", get(auth_handlers::user_permissions::<S>))
        .route("/packages/:package_id/availableRoles", get(auth_handlers::available_roles::<S>))
        .route(
            "/packages/:package_id/members",
            get(auth_handlers::list_members::<S>).post(auth_handlers::add_members::<S>),
        )
        .route(
            "/packages/:package_id/members/:user_id",
            put(auth_handlers::update_member_role::<S>).delete(auth_handlers::delete_member::<S>),
        )
        .route(
            "/packages/:package_id/apiKeys",
            get(auth_handlers::list_api_keys::<S>).post(auth_handlers::create_api_key::<S>),
        )
        .route(
            "/packages/:package_id/apiKeys/:key_id",
            axum::routing::delete(auth_handlers::revoke_api_key::<S>),
        )
        // Versions
        .route(
            "/packages/:package_id/versions",
            get(handlers::list_versions::<S>).post(handlers::publish_version::<S>),
        )
        .route(
            VERSION,
            get(handlers::get_version::<S>)
                .patch(handlers::patch_version::<S>)
                .delete(handlers::delete_version::<S>),
        )
        .route(&at(VERSION, "/revisions"), get(handlers::list_revisions::<S>))
        .route(&at(VERSION, "/documents"), get(handlers::list_documents::<S>))
        .route(&at(VERSION, "/documents/:slug"), get(handlers::get_document::<S>))
        .route(&at(VERSION, "/references"), get(handlers::list_references::<S>))
        .route(&at(VERSION, "/sources"), get(handlers::get_sources::<S>))
        // Operations and comparisons
        .route(&at(VERSION, "/operations"), get(operation_handlers::list_operations::<S>))
        .route(&at(VERSION, "/groups"), get(operation_handlers::list_groups::<S>))
        .route(&at(VERSION, "/changes"), get(operation_handlers::comparison_exists::<S>))
        .route(&at(VERSION, "/changes/summary"), get(operation_handlers::comparison_summary::<S>))
        .route(
            &at(API_TYPE, "/operations"),
            get(operation_handlers::list_api_type_operations::<S>),
        )
        .route(
            &at(API_TYPE, "/operations/:operation_id"),
            get(operation_handlers::get_operation::<S>),
        )
        .route(
            &at(API_TYPE, "/operations/:operation_id/models/:model_name/usages"),
            get(operation_handlers::model_usages::<S>),
        )
        .route(&at(API_TYPE, "/tags"), get(operation_handlers::list_tags::<S>))
        .route(&at(API_TYPE, "/deprecated"), get(operation_handlers::deprecated_operations::<S>))
        .route("/comparisons/:comparison_id/changes", get(operation_handlers::changelog::<S>))
        // Operation groups
        .route(
            &at(API_TYPE, "/groups"),
            get(operation_handlers::list_api_type_groups::<S>).post(operation_handlers::create_group::<S>),
        )
        .route(
            GROUP,
            get(operation_handlers::get_group::<S>)
                .patch(operation_handlers::update_group::<S>)
                .put(operation_handlers::replace_group::<S>)
                .delete(operation_handlers::delete_group::<S>),
        )
        .route(&at(GROUP, "/operations"), get(operation_handlers::list_group_operations::<S>))
        .route(&at(GROUP, "/template"), get(operation_handlers::get_group_template::<S>))
        .route(&at(GROUP, "/history"), get(operation_handlers::get_group_history::<S>))
        .route(&at(GROUP, "/publish"), post(operation_handlers::publish_group::<S>))
        .route(
            &at(GROUP, "/publish/:publish_id"),
            get(operation_handlers::get_publish_status::<S>),
        )
        // Exports and builds
        .route("/export", post(export_handlers::start_export::<S>))
        .route("/export/:export_id", get(export_handlers::export_result::<S>))
        .route("/export/:export_id/status", get(export_handlers::export_status::<S>))
        .route("/builds/:build_id", get(export_handlers::build_status::<S>))
        // Roles
        .route(
            "/roles",
            get(auth_handlers::list_roles::<S>).post(auth_handlers::create_role::<S>),
        )
        .route("/roles/order", put(auth_handlers::set_role_order::<S>))
        .route(
            "/roles/:role_id",
            axum::routing::patch(auth_handlers::update_role_permissions::<S>)
                .delete(auth_handlers::delete_role::<S>),
        )
        // Activity
        .route("/activity", get(handlers::all_activity::<S>))
        // Administration
        .route(
            "/admin/cleanup/migrationBuilds",
            post(export_handlers::start_migration_cleanup::<S>),
        )
        .route(
            "/admin/cleanup/migrationBuilds/:job_id",
            get(export_handlers::get_migration_cleanup::<S>),
        )
        .route("/admin/storage/migrate", post(export_handlers::migrate_storage::<S>))
}

/// Older endpoint revision serving the legacy projections.
pub fn create_legacy_router<S: Store + 'static>() -> Router<AppState<S>> {
    Router::new()
        .route("/packages", get(handlers::list_packages_legacy::<S>))
        .route("/packages/:package_id", get(handlers::get_package_legacy::<S>))
        .route("/packages/:package_id/versions", get(handlers::list_versions_legacy::<S>))
        .route("/packages/:package_id/activity", get(handlers::package_activity_legacy::<S>))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            HeaderName::from_static("content-type"),
            HeaderName::from_static("authorization"),
            HeaderName::from_static("api-key"),
            HeaderName::from_static("x-user-id"),
            HeaderName::from_static("x-user-email"),
            HeaderName::from_static("x-user-name"),
        ]);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(value) => Some(value),
            Err(_) => {
                log::warn!("Ignoring invalid allowed origin '{}'", o);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

/// Full application: health check at the root, current and legacy APIs
/// under the configured base path.
pub fn create_app<S: Store + 'static>(catalog: AppState<S>) -> Router {
    let config = catalog.config.clone();
    set_debug_errors(!config.server.production_mode);

    let api = Router::new()
        .nest("/api/v2", create_router::<S>())
        .nest("/api/v1", create_legacy_router::<S>());
    let base_path = config.server.base_path.trim_end_matches('/');
    let api = if base_path.is_empty() {
        api
    } else {
        Router::new().nest(base_path, api)
    };

    Router::new()
        .route("/health", get(handlers::health_check))
        .merge(api)
        .fallback(handlers::not_found)
        .layer(cors_layer(&config.origins_allowed()))
        .with_state(catalog)
}
