use crate::auth::{self, Role, TokenTable};
use crate::compare::Comparison;
use crate::compare_config::ComparisonConfig;
use crate::error::{Error, StoredRecord};
use crate::histogram::{Num, HISTORY_FIELD};
use crate::service::HistogramService;
use crate::traits::CollectionRef;
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::StatusCode,
    middleware,
    routing::get,
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

// Application state shared across handlers
pub struct AppState {
    pub service: HistogramService,
    pub tokens: Arc<TokenTable>,
    pub comparison: ComparisonConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// The stored histogram, on conflict
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub histogram: Option<Map<String, Value>>,
    /// The stored file names, on conflict
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub files: Option<Vec<String>>,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            histogram: None,
            files: None,
        }
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn bad_request(message: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(message)))
}

/// Map a service error onto a status code and error body
fn api_error(err: Error) -> ApiError {
    let status = match &err {
        Error::Validation(_) | Error::Incompatible { .. } | Error::NotFound { .. } => {
            StatusCode::BAD_REQUEST
        }
        Error::Conflict { .. } | Error::Stale { .. } => StatusCode::CONFLICT,
        Error::Corrupt { .. } | Error::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        warn!("Request rejected: {}", err);
    }

    let mut body = ErrorResponse::new(err.to_string());
    if let Error::Conflict { existing, .. } = err {
        match *existing {
            StoredRecord::Histogram(histogram) => {
                body.histogram = Some(histogram.to_dict(&[HISTORY_FIELD]))
            }
            StoredRecord::FileList(list) => body.files = Some(list.files()),
        }
    }
    (status, Json(body))
}

fn query_params<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    query
        .map(|Query(params)| params)
        .map_err(|rejection| bad_request(format!("missing argument ({})", rejection.body_text())))
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload.map(|Json(body)| body).map_err(|rejection| {
        error!("Failed to parse JSON request: {}", rejection);
        bad_request(format!("Invalid JSON: {}", rejection.body_text()))
    })
}

// ============================================================================
// Request / response bodies
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct DatabaseQuery {
    pub database: String,
}

#[derive(Debug, Deserialize)]
pub struct CollectionQuery {
    pub database: String,
    pub collection: String,
}

impl CollectionQuery {
    fn scope(&self) -> CollectionRef {
        CollectionRef::new(&self.database, &self.collection)
    }
}

#[derive(Debug, Deserialize)]
pub struct HistogramQuery {
    pub database: String,
    pub collection: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct CompareQuery {
    pub database: String,
    pub collection: String,
    pub reference_collection: String,
    /// Defaults to `database`
    pub reference_database: Option<String>,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct PostHistogramRequest {
    pub database: String,
    pub collection: String,
    pub histogram: Value,
    #[serde(default)]
    pub update: bool,
}

#[derive(Debug, Deserialize)]
pub struct PostFilesRequest {
    pub database: String,
    pub collection: String,
    pub files: Value,
    #[serde(default)]
    pub update: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabasesResponse {
    pub databases: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CollectionsResponse {
    pub database: String,
    pub collections: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistogramNamesResponse {
    pub database: String,
    pub collection: String,
    pub histograms: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistogramsResponse {
    pub database: String,
    pub collection: String,
    pub histograms: Vec<Map<String, Value>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistogramResponse {
    pub database: String,
    pub collection: String,
    pub histogram: Map<String, Value>,
    pub history: Vec<Num>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub updated: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FilesResponse {
    pub database: String,
    pub collection: String,
    pub files: Vec<String>,
    pub history: Vec<Num>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub updated: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompareResponse {
    pub database: String,
    pub collection: String,
    pub reference_database: String,
    pub reference_collection: String,
    pub name: String,
    pub comparison: Comparison,
}

// ============================================================================
// Handlers
// ============================================================================

async fn root_handler() -> Json<Value> {
    Json(Value::Object(Map::new()))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "store": state.service.store_name(),
    }))
}

async fn database_names_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<DatabasesResponse> {
    let databases = state.service.list_databases().await.map_err(api_error)?;
    Ok(Json(DatabasesResponse { databases }))
}

async fn collection_names_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<DatabaseQuery>, QueryRejection>,
) -> ApiResult<CollectionsResponse> {
    let DatabaseQuery { database } = query_params(query)?;
    let collections = state
        .service
        .list_collections(&database)
        .await
        .map_err(api_error)?;
    Ok(Json(CollectionsResponse {
        database,
        collections,
    }))
}

async fn histogram_names_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<CollectionQuery>, QueryRejection>,
) -> ApiResult<HistogramNamesResponse> {
    let params = query_params(query)?;
    let histograms = state
        .service
        .histogram_names(&params.scope())
        .await
        .map_err(api_error)?;
    Ok(Json(HistogramNamesResponse {
        database: params.database,
        collection: params.collection,
        histograms,
    }))
}

async fn histograms_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<CollectionQuery>, QueryRejection>,
) -> ApiResult<HistogramsResponse> {
    let params = query_params(query)?;
    let histograms = state
        .service
        .histograms(&params.scope())
        .await
        .map_err(api_error)?;
    Ok(Json(HistogramsResponse {
        database: params.database,
        collection: params.collection,
        histograms: histograms
            .iter()
            .map(|h| h.to_dict(&[HISTORY_FIELD]))
            .collect(),
    }))
}

async fn get_histogram_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<HistogramQuery>, QueryRejection>,
) -> ApiResult<HistogramResponse> {
    let params = query_params(query)?;
    let scope = CollectionRef::new(&params.database, &params.collection);
    let histogram = state
        .service
        .find_histogram(&scope, &params.name)
        .await
        .map_err(api_error)?;

    Ok(Json(HistogramResponse {
        database: params.database,
        collection: params.collection,
        histogram: histogram.to_dict(&[HISTORY_FIELD]),
        history: histogram.history().to_vec(),
        updated: None,
    }))
}

async fn post_histogram_handler(
    State(state): State<Arc<AppState>>,
    Extension(role): Extension<Role>,
    payload: Result<Json<PostHistogramRequest>, JsonRejection>,
) -> ApiResult<HistogramResponse> {
    auth::ensure_writer(role)?;
    let request = json_body(payload)?;
    let scope = CollectionRef::new(&request.database, &request.collection);

    let outcome = state
        .service
        .post_histogram(&scope, &request.histogram, request.update)
        .await
        .map_err(api_error)?;

    info!(
        "📊 {} histogram '{}' in {}",
        if outcome.updated { "Updated" } else { "Created" },
        outcome.record.name(),
        scope
    );

    Ok(Json(HistogramResponse {
        database: request.database,
        collection: request.collection,
        histogram: outcome.record.to_dict(&[HISTORY_FIELD]),
        history: outcome.record.history().to_vec(),
        updated: Some(outcome.updated),
    }))
}

async fn get_files_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<CollectionQuery>, QueryRejection>,
) -> ApiResult<FilesResponse> {
    let params = query_params(query)?;
    let list = state
        .service
        .find_filelist(&params.scope())
        .await
        .map_err(api_error)?;

    Ok(Json(FilesResponse {
        database: params.database,
        collection: params.collection,
        files: list.files(),
        history: list.history().as_slice().to_vec(),
        updated: None,
    }))
}

async fn post_files_handler(
    State(state): State<Arc<AppState>>,
    Extension(role): Extension<Role>,
    payload: Result<Json<PostFilesRequest>, JsonRejection>,
) -> ApiResult<FilesResponse> {
    auth::ensure_writer(role)?;
    let request = json_body(payload)?;
    let scope = CollectionRef::new(&request.database, &request.collection);

    let outcome = state
        .service
        .post_files(&scope, &request.files, request.update)
        .await
        .map_err(api_error)?;

    info!("📁 Stored {} files in {}", outcome.record.len(), scope);

    Ok(Json(FilesResponse {
        database: request.database,
        collection: request.collection,
        files: outcome.record.files(),
        history: outcome.record.history().as_slice().to_vec(),
        updated: Some(outcome.updated),
    }))
}

async fn compare_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<CompareQuery>, QueryRejection>,
) -> ApiResult<CompareResponse> {
    let params = query_params(query)?;
    let reference_database = params
        .reference_database
        .clone()
        .unwrap_or_else(|| params.database.clone());

    let comparison = state
        .service
        .compare_histogram(
            &CollectionRef::new(&params.database, &params.collection),
            &CollectionRef::new(&reference_database, &params.reference_collection),
            &params.name,
            &state.comparison,
        )
        .await
        .map_err(api_error)?;

    Ok(Json(CompareResponse {
        database: params.database,
        collection: params.collection,
        reference_database,
        reference_collection: params.reference_collection,
        name: params.name,
        comparison,
    }))
}

/// Build the application router
///
/// `/` and `/health` are open; every other route requires a bearer token.
pub fn build_router(state: Arc<AppState>) -> Router {
    let authenticated = Router::new()
        .route("/databases/names", get(database_names_handler))
        .route("/collections/names", get(collection_names_handler))
        .route("/collections/histograms/names", get(histogram_names_handler))
        .route("/collections/histograms", get(histograms_handler))
        .route(
            "/histogram",
            get(get_histogram_handler).post(post_histogram_handler),
        )
        .route("/histogram/compare", get(compare_handler))
        .route(
            "/files/names",
            get(get_files_handler).post(post_files_handler),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.tokens),
            auth::require_token,
        ));

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .merge(authenticated)
        .with_state(state)
}
