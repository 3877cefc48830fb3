use axum::routing::get;
use axum::Router;
use tower_http::compression::CompressionLayer;

use crate::handlers;
use crate::state::AppState;

/// Builds the full `fastfsd` router.
///
/// `/data/*path` is the public range surface and carries compression;
/// `/block/*path` is the internal, node-to-node surface used for
/// redirect-unless-force ownership routing and must never be compressed,
/// since the response may itself be a 301 the caller needs untouched.
pub fn build(state: AppState) -> Router {
    let data_routes = Router::new()
        .route(
            "/data/*path",
            get(handlers::data_get)
                .head(handlers::head_data)
                .put(handlers::data_put)
                .delete(handlers::delete_data),
        )
        .layer(CompressionLayer::new());

    let uncompressed_routes = Router::new()
        .route("/block/*path", get(handlers::block_get).put(handlers::block_put))
        .route("/confirm/*path", get(handlers::confirm_get))
        .route("/ls/*path", get(handlers::ls_get))
        .route("/setup", get(handlers::setup_get))
        .route("/query/*path", get(handlers::query_get));

    Router::new()
        .merge(data_routes)
        .merge(uncompressed_routes)
        .with_state(state)
}
