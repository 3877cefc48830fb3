use std::sync::Arc;

use axum::body::Bytes as AxumBytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use tracing::{debug, error, warn};

use fastfs_datamanager::{DataError, DataResult};
use fastfs_index::FileInfo;
use fastfs_proto::{DataQuery, ErrorResponse, FileResponse, LsResponse, SetupResponse};

use crate::state::AppState;
use crate::sync_reader::BufferedReader;

fn data_error_status(err: &DataError) -> StatusCode {
    match err {
        DataError::NotFound { .. } => StatusCode::NOT_FOUND,
        DataError::Transient { .. } => StatusCode::SERVICE_UNAVAILABLE,
        DataError::Fatal { .. } | DataError::OutOfSlots => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn data_error_response(err: Arc<DataError>) -> Response {
    let status = data_error_status(&err);
    (status, Json(ErrorResponse::new(err.to_string()))).into_response()
}

fn peer_error(path: &str, block: u64, source: impl std::error::Error + Send + Sync + 'static) -> Arc<DataError> {
    Arc::new(DataError::Transient {
        path: path.to_string(),
        block,
        source: Arc::new(source),
    })
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub offset: Option<u64>,
    pub len: Option<u64>,
}

/// `GET /data/{path}` — stream an (optionally sub-range of an) entire file,
/// fanning out across whichever nodes own each block. This is the
/// public-facing range endpoint, compressed when the client accepts it.
pub async fn data_get(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<RangeQuery>,
) -> Response {
    let info = match state.index.get_file_info(&path).await {
        Ok(Some(info)) => info,
        Ok(None) => {
            return (StatusCode::NOT_FOUND, Json(ErrorResponse::new("unknown file"))).into_response()
        }
        Err(e) => {
            error!(path, error = %e, "location index lookup failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse::new(e.to_string()))).into_response();
        }
    };

    let offset = query.offset.unwrap_or(0);
    let len = query.len.unwrap_or(info.size.saturating_sub(offset));

    let mut buf = Vec::with_capacity(len as usize);
    match state.aggregator.write_to(&mut buf, &path, offset, len).await {
        Ok(_) => ([(header::CONTENT_TYPE, "application/octet-stream")], buf).into_response(),
        Err(e) => {
            error!(path, offset, len, error = %e, "range aggregation failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse::new(e.to_string()))).into_response()
        }
    }
}

/// `HEAD /data/{path}` — size probe for range clients.
pub async fn head_data(State(state): State<AppState>, Path(path): Path<String>) -> Response {
    match state.index.get_file_info(&path).await {
        Ok(Some(info)) => (
            StatusCode::OK,
            [
                (header::CONTENT_LENGTH, info.size.to_string()),
                (header::ACCEPT_RANGES, "bytes".to_string()),
            ],
        )
            .into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!(path, error = %e, "location index lookup failed for HEAD");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// `DELETE /data/{path}` — remove the object. Cached blocks are left for
/// TTL/eviction to clean up, matching the object store being the sole
/// source of truth.
pub async fn delete_data(State(state): State<AppState>, Path(path): Path<String>) -> Response {
    match state.dm.delete(&path).await {
        Ok(()) => {
            if let Err(e) = state.index.delete_file(&path).await {
                warn!(path, error = %e, "failed to remove file metadata after delete");
            }
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => data_error_response(e),
    }
}

/// `PUT /data/{path}` — whole-body upload, chunked into blocks and pushed
/// in parallel. Kept as a compatibility path alongside the per-block PUT
/// + `/confirm` path, which is the one a well-behaved client should use
/// since it can retry a single failed block instead of the whole file.
pub async fn data_put(State(state): State<AppState>, Path(path): Path<String>, body: AxumBytes) -> Response {
    let size = body.len() as u64;
    let mut reader = BufferedReader::new(body);
    match state.reverse_aggregator.read_from(&mut reader, &path, 0).await {
        Ok(blocks) => {
            let info = FileInfo {
                path: path.clone(),
                size,
                block_size: state.block_size as u32,
                num_blocks: blocks,
            };
            if let Err(e) = state.index.put_file_info(&info).await {
                warn!(path, error = %e, "failed to record file metadata after upload");
            }
            StatusCode::CREATED.into_response()
        }
        Err(e) => {
            error!(path, error = %e, "whole-file upload failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse::new(e.to_string()))).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConfirmQuery {
    pub numblocks: u64,
    pub numwritten: u64,
}

/// `GET /confirm/{path}?numblocks,numwritten` — finalize an upload done via
/// per-block PUTs by recording the file's metadata in the listing index.
pub async fn confirm_get(State(state): State<AppState>, Path(path): Path<String>, Query(query): Query<ConfirmQuery>) -> Response {
    let info = FileInfo {
        path: path.clone(),
        size: query.numwritten,
        block_size: state.block_size as u32,
        num_blocks: query.numblocks,
    };
    match state.index.put_file_info(&info).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            error!(path, error = %e, "failed to finalize upload");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse::new(e.to_string()))).into_response()
        }
    }
}

async fn fetch_from_peer(state: &AppState, peer: &str, path: &str, block: u64) -> DataResult<Bytes> {
    let url = format!("http://{peer}/block/{path}?block={block}&force=1&cache=onlyCache");
    let resp = state
        .http
        .get(&url)
        .send()
        .await
        .map_err(|e| peer_error(path, block, e))?;
    if !resp.status().is_success() {
        return Err(peer_error(
            path,
            block,
            std::io::Error::other(format!("peer {peer} returned {}", resp.status())),
        ));
    }
    resp.bytes().await.map_err(|e| peer_error(path, block, e))
}

/// Serve a block this node owns per the ring. Tries the local cache first;
/// on a miss, consults the location index for a peer that might still be
/// holding it (migration on miss) before falling through to the object
/// store.
async fn serve_owned_block(state: &AppState, path: &str, block: u64) -> DataResult<Bytes> {
    if let Some(data) = state.dm.cache_get(path, block).await {
        return Ok(data);
    }

    match state.index.get_block_location(path, block).await {
        Ok(Some(peer)) if peer != state.local_addr => {
            match fetch_from_peer(state, &peer, path, block).await {
                Ok(data) => {
                    if let Err(e) = state.dm.cache_put(path, block, data.clone()).await {
                        warn!(path, block, error = %e, "failed to cache block migrated from peer");
                    }
                    return Ok(data);
                }
                Err(e) => {
                    warn!(path, block, peer, error = %e, "peer migration GET failed, falling back to object store");
                }
            }
        }
        Ok(_) => {}
        Err(e) => {
            warn!(path, block, error = %e, "location index lookup failed, falling back to object store");
        }
    }

    state.dm.get(path, block).await
}

/// `GET /block/{path}?block=N&force=1` — fetch exactly one block. Redirects
/// to the owning node unless `force=1`, matching the frontend's
/// redirect-unless-force rule. Never compressed: this is the internal,
/// node-to-node surface. `cache=onlyCache` marks a peer draining this
/// block during an ownership migration: serve from cache only and evict.
pub async fn block_get(State(state): State<AppState>, Path(path): Path<String>, Query(query): Query<DataQuery>) -> Response {
    let Some(block) = query.block else {
        return (StatusCode::BAD_REQUEST, Json(ErrorResponse::new("missing block parameter"))).into_response();
    };

    let owner = state.ring.get_server(&path, block).await;
    match owner {
        Some(ref owner) if owner != &state.local_addr && !query.is_forced() => {
            let location = format!("http://{owner}/block/{path}?block={block}&force=1");
            debug!(path, block, %owner, "redirecting block request to owning node");
            return Redirect::permanent(&location).into_response();
        }
        None => return (StatusCode::SERVICE_UNAVAILABLE, Json(ErrorResponse::new("no nodes available"))).into_response(),
        Some(_) => {}
    }

    if query.is_only_cache() {
        return match state.dm.cache_get(&path, block).await {
            Some(data) => {
                state.dm.cache_delete(&path, block).await;
                debug!(path, block, "served and evicted block for peer migration drain");
                ([(header::CONTENT_TYPE, "application/octet-stream")], data.to_vec()).into_response()
            }
            None => (StatusCode::NOT_FOUND, Json(ErrorResponse::new("block not cached"))).into_response(),
        };
    }

    match serve_owned_block(&state, &path, block).await {
        Ok(data) => {
            if let Err(e) = state.index.put_block_location(&path, block, &state.local_addr).await {
                warn!(path, block, error = %e, "failed to record block location");
            }
            ([(header::CONTENT_TYPE, "application/octet-stream")], data.to_vec()).into_response()
        }
        Err(e) => data_error_response(e),
    }
}

/// `PUT /block/{path}?block=N` — write exactly one block. Advisory cache
/// write; the object store only learns about the data via `/confirm` or
/// the whole-body PUT path.
pub async fn block_put(State(state): State<AppState>, Path(path): Path<String>, Query(query): Query<DataQuery>, body: AxumBytes) -> Response {
    let Some(block) = query.block else {
        return (StatusCode::BAD_REQUEST, Json(ErrorResponse::new("missing block parameter"))).into_response();
    };
    match state.dm.cache_put(&path, block, body).await {
        Ok(()) => {
            if let Err(e) = state.index.put_block_location(&path, block, &state.local_addr).await {
                warn!(path, block, error = %e, "failed to record block location");
            }
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => {
            warn!(path, block, error = %e, "block cache write failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// `GET /ls/{path}` — list files under a prefix.
pub async fn ls_get(State(state): State<AppState>, Path(path): Path<String>) -> Response {
    match state.objects.list(&path).await {
        Ok(entries) => {
            let files = entries
                .into_iter()
                .map(|e| FileResponse {
                    filename: e.key,
                    file_size: e.size,
                })
                .collect();
            Json(LsResponse { files }).into_response()
        }
        Err(e) => {
            error!(path, error = %e, "listing failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse::new(e.to_string()))).into_response()
        }
    }
}

/// `GET /setup` — cluster membership and block size, so clients can route
/// requests themselves instead of asking for every block.
pub async fn setup_get(State(state): State<AppState>) -> Response {
    let servers = state.membership.members().await;
    Json(SetupResponse {
        servers,
        block_size: state.block_size as u32,
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct QueryParams {
    pub block: u64,
    pub column: usize,
    pub value: String,
}

/// `GET /query/{path}?block=N&column=N&value=V` — optional newline-aligned,
/// single-column equality filter over one block of a CSV file.
pub async fn query_get(State(state): State<AppState>, Path(path): Path<String>, Query(params): Query<QueryParams>) -> Response {
    let data = match state.dm.get(&path, params.block).await {
        Ok(data) => data,
        Err(e) => return data_error_response(e),
    };

    let aligned = fastfs_csv::aligned_slice(&data, params.block > 0, state.block_size as usize);
    match fastfs_csv::filter_rows_eq(aligned, params.column, &params.value, true) {
        Ok(filtered) => ([(header::CONTENT_TYPE, "text/csv")], filtered).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(e.to_string()))).into_response(),
    }
}
