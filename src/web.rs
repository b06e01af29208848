use crate::{
    config::Config,
    quantity::generate_quantities,
    semantic::{normalize_ingredients, QueryResponse, QueryService, RecipeHit, RecipeSearchError, ReloadReport},
};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderValue, Method},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::signal;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

#[derive(Clone)]
pub struct SharedState {
    service: Arc<QueryService>,
    default_top_k: usize,
    quantity_seed: Option<u64>,
}

impl SharedState {
    pub fn new(service: Arc<QueryService>, config: &Config) -> Self {
        Self {
            service,
            default_top_k: config.server.default_top_k,
            quantity_seed: config.server.quantity_seed,
        }
    }
}

pub fn router(state: SharedState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/api/recipe", post(recipe))
        .route("/api/reload", post(reload))
        .layer(cors_layer(cors_origins))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(Arc::new(state))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    if origins.iter().any(|origin| origin == "*") {
        return cors.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                log::warn!("ignoring invalid cors origin {origin:?}");
                None
            }
        })
        .collect();

    cors.allow_origin(AllowOrigin::list(origins))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::warn!("shutting down");
}

async fn start_app(config: Config, service: Arc<QueryService>, listen: String) -> anyhow::Result<()> {
    let state = SharedState::new(service, &config);
    let app = router(state, &config.server.cors_origins);

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    log::info!("listening on {listen}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Serve the HTTP API until Ctrl-C or SIGTERM.
pub fn start_daemon(config: Config, service: Arc<QueryService>, listen: Option<String>) -> anyhow::Result<()> {
    let listen = listen.unwrap_or_else(|| config.server.listen.clone());

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(start_app(config, service, listen))
}

#[derive(Debug)]
enum HttpError {
    Search(RecipeSearchError),
    /// The request body did not deserialize.
    Body(JsonRejection),
}

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        match self {
            HttpError::Body(rejection) => (
                rejection.status(),
                Json(json!({"error": rejection.body_text()})),
            ),
            HttpError::Search(err @ RecipeSearchError::InvalidQuery(_)) => (
                axum::http::StatusCode::BAD_REQUEST,
                Json(json!({"error": err.to_string()})),
            ),
            HttpError::Search(err) => {
                log::error!("{err:?}");
                (
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": err.to_string()})),
                )
            }
        }
        .into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<RecipeSearchError>,
{
    fn from(err: E) -> Self {
        Self::Search(err.into())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecipeRequest {
    pub ingredients: Vec<String>,
    /// Uses `server.default_top_k` when absent.
    pub top_k: Option<usize>,
}

/// A ranked recipe; the best match also carries display fields.
#[derive(Debug, Serialize)]
pub struct RecipeResult {
    #[serde(flatten)]
    pub hit: RecipeHit,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipe_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_by_step: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RecipeResponse {
    pub query: Vec<String>,
    pub results: Vec<RecipeResult>,
}

fn enrich(response: QueryResponse, seed: u64) -> RecipeResponse {
    let quantity = generate_quantities(&normalize_ingredients(&response.query), seed);

    let results = response
        .results
        .into_iter()
        .enumerate()
        .map(|(rank, hit)| {
            if rank > 0 {
                return RecipeResult {
                    hit,
                    quantity: None,
                    recipe_name: None,
                    step_by_step: None,
                };
            }

            RecipeResult {
                quantity: Some(quantity.clone()),
                recipe_name: Some(hit.recipe.name.clone()),
                step_by_step: Some(hit.recipe.text.clone()),
                hit,
            }
        })
        .collect();

    RecipeResponse {
        query: response.query,
        results,
    }
}

async fn recipe(
    State(state): State<Arc<SharedState>>,
    payload: Result<Json<RecipeRequest>, JsonRejection>,
) -> Result<Json<RecipeResponse>, HttpError> {
    let Json(payload) = payload.map_err(HttpError::Body)?;
    log::debug!("payload: {payload:?}");

    let top_k = payload.top_k.unwrap_or(state.default_top_k);
    let seed = state.quantity_seed.unwrap_or_else(rand::random);

    tokio::task::block_in_place(move || {
        let response = state.service.query(&payload.ingredients, top_k)?;
        Ok(Json(enrich(response, seed)))
    })
}

async fn reload(State(state): State<Arc<SharedState>>) -> Result<Json<ReloadReport>, HttpError> {
    tokio::task::block_in_place(move || {
        let report = state.service.reload()?;
        Ok(Json(report))
    })
}
