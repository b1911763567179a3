//! HTTP surface of the wallet service.
//!
//! All endpoints are JSON. Authenticated requests carry `x-identity`
//! (copayer id) and `x-signature` (hex ECDSA over
//! `lowercase(method)|path|bodyJson`, `{}` standing in for an empty
//! body); the signed path includes the base path the API is mounted
//! under.

use axum::{
    Json, Router,
    body::Body,
    extract::{OriginalUri, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use mws::{
    Service, ServiceError,
    service::{CreateAddressOptions, auth},
};
use mws_api::{
    BalanceQuery, CreateAddressRequest, CreateTxRequest,
    CreateWalletRequest, CreateWalletResponse, ErrorBody, FeeLevelsQuery,
    HEADER_CLIENT_VERSION, HEADER_IDENTITY, HEADER_SIGNATURE,
    HistoryQuery, JoinWalletRequest, ListAddressesQuery,
    NotificationsQuery, PublishTxRequest, RejectTxRequest, ScanRequest,
    SavePreferencesRequest, SendMaxInfoQuery, SignTxRequest,
};
use tower_http::{
    cors::CorsLayer,
    limit::RequestBodyLimitLayer,
    request_id::{
        MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
    },
    trace::{DefaultOnFailure, DefaultOnResponse, TraceLayer},
};

const MAX_BODY_BYTES: usize = 100 * 1024;
const DEFAULT_NOTIFICATION_LIMIT: usize = 100;
const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub service: Service,
}

pub struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let (status, code) = match err.code() {
            Some("NOT_AUTHORIZED") => {
                (StatusCode::UNAUTHORIZED, "NOT_AUTHORIZED")
            }
            Some(code) => (StatusCode::BAD_REQUEST, code),
            None => {
                tracing::error!(%err, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        };
        let body = ErrorBody {
            code: code.to_owned(),
            message: err.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Authenticates a request against the copayer's registered request keys,
/// then applies the wallet-scoped client-version gate (the wallet's
/// derivation scheme decides which clients are too old).
fn authenticate(
    state: &AppState,
    method: &str,
    uri: &axum::http::Uri,
    headers: &HeaderMap,
    body: &str,
) -> Result<mws::service::AuthedRequest, ApiError> {
    let identity = header(headers, HEADER_IDENTITY)
        .ok_or(ServiceError::NotAuthorized)?;
    let signature = header(headers, HEADER_SIGNATURE)
        .ok_or(ServiceError::NotAuthorized)?;
    let url = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let message = auth::request_message(method, url, body);
    let authed = state.service.authenticate(identity, &message, signature)?;
    state.service.check_client_version(
        header(headers, HEADER_CLIENT_VERSION),
        &authed.wallet,
    )?;
    Ok(authed)
}

fn parse_body<T: serde::de::DeserializeOwned>(
    body: &str,
) -> Result<T, ApiError> {
    serde_json::from_str(body).map_err(|err| {
        ApiError(ServiceError::BadRequest(format!("invalid body: {err}")))
    })
}

// Unauthenticated endpoints

async fn create_wallet(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<CreateWalletResponse>, ApiError> {
    let opts: CreateWalletRequest = parse_body(&body)?;
    let wallet_id = state.service.create_wallet(opts).await?;
    Ok(Json(CreateWalletResponse { wallet_id }))
}

async fn join_wallet(
    State(state): State<AppState>,
    Path(wallet_id): Path<String>,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let opts: JoinWalletRequest = parse_body(&body)?;
    let result = state.service.join_wallet(&wallet_id, opts).await?;
    Ok(Json(result))
}

async fn add_access(
    State(state): State<AppState>,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let opts: mws_api::AddAccessRequest = parse_body(&body)?;
    state.service.add_access(opts).await?;
    Ok(Json(serde_json::json!({})))
}

async fn fee_levels(
    State(state): State<AppState>,
    Query(query): Query<FeeLevelsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let network = query.network;
    let levels = state.service.get_fee_levels(network).await?;
    Ok(Json(levels))
}

async fn stats(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.get_stats()?))
}

// Authenticated endpoints

async fn wallet_status(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let authed = authenticate(&state, "get", &uri, &headers, "")?;
    Ok(Json(state.service.get_status(&authed).await?))
}

async fn get_preferences(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let authed = authenticate(&state, "get", &uri, &headers, "")?;
    Ok(Json(state.service.get_preferences(&authed)?))
}

async fn save_preferences(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let authed = authenticate(&state, "put", &uri, &headers, &body)?;
    let req: SavePreferencesRequest = parse_body(&body)?;
    let preferences = state.service.save_preferences(
        &authed,
        req.email,
        req.language,
        req.unit,
    )?;
    Ok(Json(preferences))
}

async fn pending_txps(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let authed = authenticate(&state, "get", &uri, &headers, "")?;
    Ok(Json(state.service.get_pending_txs(&authed)?))
}

async fn create_txp(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let authed = authenticate(&state, "post", &uri, &headers, &body)?;
    let opts: CreateTxRequest = parse_body(&body)?;
    Ok(Json(state.service.create_tx(&authed, opts).await?))
}

async fn get_txp(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(txp_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let authed = authenticate(&state, "get", &uri, &headers, "")?;
    Ok(Json(state.service.get_tx(&authed, &txp_id)?))
}

async fn publish_txp(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(txp_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let authed = authenticate(&state, "post", &uri, &headers, &body)?;
    let req: PublishTxRequest = parse_body(&body)?;
    let txp = state
        .service
        .publish_tx(&authed, &txp_id, &req.proposal_signature)
        .await?;
    Ok(Json(txp))
}

async fn sign_txp(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(txp_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let authed = authenticate(&state, "post", &uri, &headers, &body)?;
    let req: SignTxRequest = parse_body(&body)?;
    let txp = state
        .service
        .sign_tx(&authed, &txp_id, req.signatures, req.xpub)
        .await?;
    Ok(Json(txp))
}

async fn broadcast_txp(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(txp_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let authed = authenticate(&state, "post", &uri, &headers, &body)?;
    Ok(Json(state.service.broadcast_tx(&authed, &txp_id).await?))
}

async fn reject_txp(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(txp_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let authed = authenticate(&state, "post", &uri, &headers, &body)?;
    let req: RejectTxRequest = parse_body(&body)?;
    let txp = state
        .service
        .reject_tx(&authed, &txp_id, req.comment)
        .await?;
    Ok(Json(txp))
}

async fn remove_txp(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(txp_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let authed = authenticate(&state, "delete", &uri, &headers, "")?;
    state.service.remove_pending_tx(&authed, &txp_id).await?;
    Ok(Json(serde_json::json!({})))
}

async fn list_addresses(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Query(query): Query<ListAddressesQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let authed = authenticate(&state, "get", &uri, &headers, "")?;
    let addresses = state.service.list_addresses(
        &authed,
        query.limit,
        query.newest_first,
    )?;
    Ok(Json(addresses))
}

async fn create_address(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let authed = authenticate(&state, "post", &uri, &headers, &body)?;
    let req: CreateAddressRequest = parse_body(&body)?;
    let address = state
        .service
        .create_address(
            &authed,
            CreateAddressOptions {
                ignore_max_gap: req.ignore_max_gap,
            },
        )
        .await?;
    Ok(Json(address))
}

async fn scan_addresses(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let authed = authenticate(&state, "post", &uri, &headers, &body)?;
    let req: ScanRequest = parse_body(&body)?;
    state
        .service
        .start_scan(&authed, req.include_copayer_branches)
        .await?;
    Ok(Json(serde_json::json!({ "started": true })))
}

async fn balance(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Query(query): Query<BalanceQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let authed = authenticate(&state, "get", &uri, &headers, "")?;
    Ok(Json(state.service.get_balance(&authed, query.two_step).await?))
}

async fn utxos(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let authed = authenticate(&state, "get", &uri, &headers, "")?;
    Ok(Json(state.service.get_utxos(&authed).await?))
}

async fn tx_history(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let authed = authenticate(&state, "get", &uri, &headers, "")?;
    let items = state
        .service
        .get_tx_history(
            &authed,
            query.skip,
            query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT),
        )
        .await?;
    Ok(Json(items))
}

async fn notifications(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Query(query): Query<NotificationsQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let authed = authenticate(&state, "get", &uri, &headers, "")?;
    let notifications = state.service.get_notifications(
        &authed,
        query.notification_id.as_deref(),
        query.limit.unwrap_or(DEFAULT_NOTIFICATION_LIMIT),
    )?;
    Ok(Json(notifications))
}

async fn send_max_info(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Query(query): Query<SendMaxInfoQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let authed = authenticate(&state, "get", &uri, &headers, "")?;
    let info = state
        .service
        .get_send_max_info(
            &authed,
            query.fee_per_kb,
            query.exclude_unconfirmed_utxos,
        )
        .await?;
    Ok(Json(info))
}

fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/v1/wallets", post(create_wallet).get(wallet_status))
        .route("/v1/wallets/{id}/copayers", post(join_wallet))
        .route("/v1/copayers", put(add_access))
        .route(
            "/v1/preferences",
            get(get_preferences).put(save_preferences),
        )
        .route("/v1/txproposals", get(pending_txps).post(create_txp))
        .route("/v1/txproposals/{id}", get(get_txp).delete(remove_txp))
        .route("/v1/txproposals/{id}/publish", post(publish_txp))
        .route("/v1/txproposals/{id}/signatures", post(sign_txp))
        .route("/v1/txproposals/{id}/broadcast", post(broadcast_txp))
        .route("/v1/txproposals/{id}/rejections", post(reject_txp))
        .route("/v1/addresses", get(list_addresses).post(create_address))
        .route("/v1/addresses/scan", post(scan_addresses))
        .route("/v1/balance", get(balance))
        .route("/v1/utxos", get(utxos))
        .route("/v1/txhistory", get(tx_history))
        .route("/v1/notifications", get(notifications))
        .route("/v1/sendmaxinfo", get(send_max_info))
        .route("/v1/feelevels", get(fee_levels))
        .route("/v1/stats", get(stats))
}

#[derive(Clone, Debug)]
struct RequestIdMaker;

impl MakeRequestId for RequestIdMaker {
    fn make_request_id<B>(
        &mut self,
        _: &http::Request<B>,
    ) -> Option<RequestId> {
        use uuid::Uuid;
        // the 'simple' format renders the UUID with no dashes, which
        // makes for easier copy/pasting.
        let id = Uuid::new_v4();
        let id = id.as_simple();
        let id = format!("req_{id}");
        let Ok(header_value) = http::HeaderValue::from_str(&id) else {
            return None;
        };
        Some(RequestId::new(header_value))
    }
}

pub fn router(service: Service, base_path: &str) -> Router {
    const REQUEST_ID_HEADER: &str = "x-request-id";

    let state = AppState { service };
    let api = v1_router().with_state(state);

    // Ordering here matters! Order here is from official docs on request
    // IDs tracing:
    // https://docs.rs/tower-http/latest/tower_http/request_id/index.html#using-trace
    let tracer = tower::ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(
            http::HeaderName::from_static(REQUEST_ID_HEADER),
            RequestIdMaker,
        ))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(move |request: &http::Request<Body>| {
                    let request_id = request
                        .headers()
                        .get(http::HeaderName::from_static(REQUEST_ID_HEADER))
                        .and_then(|h| h.to_str().ok())
                        .filter(|s| !s.is_empty());
                    tracing::span!(
                        tracing::Level::DEBUG,
                        "request",
                        method = %request.method(),
                        uri = %request.uri(),
                        request_id,
                    )
                })
                .on_request(())
                .on_eos(())
                .on_response(
                    DefaultOnResponse::new().level(tracing::Level::INFO),
                )
                .on_failure(
                    DefaultOnFailure::new().level(tracing::Level::ERROR),
                ),
        )
        .layer(PropagateRequestIdLayer::new(http::HeaderName::from_static(
            REQUEST_ID_HEADER,
        )))
        .into_inner();

    let base = if base_path.is_empty() || base_path == "/" {
        return Router::new()
            .merge(api)
            .layer(tracer)
            .layer(CorsLayer::permissive())
            .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES));
    } else {
        base_path.trim_end_matches('/')
    };
    Router::new()
        .nest(base, api)
        .layer(tracer)
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
}
