//! API v1 routes: apply, read and delete stored records.
//!
//! `PUT` is apply: the body replaces labels, annotations, spec and status of
//! the record at the path; server metadata is kept. FullConfigs are derived
//! and therefore read-only here.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tracing::info;

use super::error::ApiError;
use crate::resources::{ClusterConfig, FullConfig, Node, NodeConfig, ObjectKey, Pod};
use crate::state::AppState;
use crate::store::{apply, Stored};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/clusterconfigs", get(list::<ClusterConfig>))
        .route(
            "/clusterconfigs/{namespace}/{name}",
            get(get_namespaced::<ClusterConfig>)
                .put(put_namespaced::<ClusterConfig>)
                .delete(delete_namespaced::<ClusterConfig>),
        )
        .route("/nodeconfigs", get(list::<NodeConfig>))
        .route(
            "/nodeconfigs/{namespace}/{name}",
            get(get_namespaced::<NodeConfig>)
                .put(put_namespaced::<NodeConfig>)
                .delete(delete_namespaced::<NodeConfig>),
        )
        .route("/pods", get(list::<Pod>))
        .route(
            "/pods/{namespace}/{name}",
            get(get_namespaced::<Pod>)
                .put(put_namespaced::<Pod>)
                .delete(delete_namespaced::<Pod>),
        )
        .route("/nodes", get(list::<Node>))
        .route(
            "/nodes/{name}",
            get(get_node).put(put_node).delete(delete_node),
        )
        .route("/fullconfigs", get(list::<FullConfig>))
        .route(
            "/fullconfigs/{namespace}/{name}",
            get(get_namespaced::<FullConfig>),
        )
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub namespace: Option<String>,
}

async fn list<K: Stored>(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<K>>, ApiError> {
    let items = K::store(state.cluster())
        .list(query.namespace.as_deref())
        .await?;
    Ok(Json(items))
}

async fn get_namespaced<K: Stored>(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<K>, ApiError> {
    let key = ObjectKey::new(namespace, name);
    Ok(Json(K::store(state.cluster()).get(&key).await?))
}

async fn put_namespaced<K: Stored>(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(body): Json<K>,
) -> Result<Json<K>, ApiError> {
    put(&state, ObjectKey::new(namespace, name), body).await
}

async fn delete_namespaced<K: Stored>(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    delete::<K>(&state, ObjectKey::new(namespace, name)).await
}

async fn get_node(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Node>, ApiError> {
    let key = ObjectKey::cluster_scoped(name);
    Ok(Json(state.cluster().nodes.get(&key).await?))
}

async fn put_node(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<Node>,
) -> Result<Json<Node>, ApiError> {
    put(&state, ObjectKey::cluster_scoped(name), body).await
}

async fn delete_node(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    delete::<Node>(&state, ObjectKey::cluster_scoped(name)).await
}

async fn put<K: Stored>(
    state: &AppState,
    key: ObjectKey,
    mut body: K,
) -> Result<Json<K>, ApiError> {
    let meta = body.meta_mut();
    if !meta.name.is_empty() && meta.name != key.name {
        return Err(ApiError::bad_request(
            "name_mismatch",
            format!("metadata.name {:?} does not match path {:?}", meta.name, key.name),
        ));
    }
    if K::NAMESPACED && !meta.namespace.is_empty() && meta.namespace != key.namespace {
        return Err(ApiError::bad_request(
            "namespace_mismatch",
            format!(
                "metadata.namespace {:?} does not match path {:?}",
                meta.namespace, key.namespace
            ),
        ));
    }
    meta.name = key.name.clone();
    meta.namespace = key.namespace.clone();

    let applied = apply(K::store(state.cluster()).as_ref(), body).await?;
    info!(
        kind = K::KIND,
        key = %key,
        resource_version = applied.meta().resource_version,
        "Applied resource"
    );
    Ok(Json(applied))
}

async fn delete<K: Stored>(state: &AppState, key: ObjectKey) -> Result<StatusCode, ApiError> {
    K::store(state.cluster()).delete(&key).await?;
    info!(kind = K::KIND, key = %key, "Deleted resource");
    Ok(StatusCode::NO_CONTENT)
}
