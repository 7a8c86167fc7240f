use crate::config::AppConfig;
use crate::i18n::I18n;
use crate::limit::{Limit, LimitConfig, LimitType};
use crate::listener::Listener;
use crate::pipeline::Pipeline;
use crate::router::DispatchTable;
use crate::store::CounterStore;
use crate::token;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{Request, Response};
use axum::routing::any;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

/// Assemble the pipeline from config and its collaborators. The token
/// backend and the process-wide per-IP limiter are fixed here, at startup.
pub fn build_pipeline(
    config: &AppConfig,
    store: Arc<dyn CounterStore>,
    i18n: Arc<I18n>,
    listener: Arc<dyn Listener>,
    dispatch: DispatchTable,
) -> Pipeline {
    let storage = token::storage_from_config(&config.auth.backend, &store);
    let global_limit = Limit::new(
        store,
        LimitConfig {
            limit_type: LimitType::Ip,
            max_times: config.global_limit.max_times,
            interval: Duration::from_secs(config.global_limit.interval_secs),
        },
    );

    Pipeline::new(
        dispatch,
        i18n,
        listener,
        global_limit,
        storage,
        config.auth.cookie_name.clone(),
        config.auth.header_name.clone(),
    )
}

/// Every request funnels through the pipeline's dispatch table; axum only
/// provides the listener loop.
pub fn build_app(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .fallback(any(dispatch_handler))
        .with_state(AppState { pipeline })
}

pub async fn run_server(config: Arc<AppConfig>, pipeline: Arc<Pipeline>) -> Result<(), String> {
    let listen_addr: SocketAddr = config
        .listen
        .parse()
        .map_err(|err| format!("invalid listen address `{}`: {err}", config.listen))?;
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .map_err(|err| format!("failed to bind `{listen_addr}`: {err}"))?;

    let app = build_app(pipeline);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|err| format!("server error: {err}"))
}

async fn dispatch_handler(State(state): State<AppState>, request: Request<Body>) -> Response<Body> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|connect_info| connect_info.0);

    state.pipeline.handle(request, peer).await
}
