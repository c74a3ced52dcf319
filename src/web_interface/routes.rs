use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::ws::{Message, WebSocket, Ws};
use warp::{reply, Filter, Rejection, Reply};

use super::types::*;
use crate::controller::output_hub::StreamFrame;
use crate::controller::proxy_service::ProxyService;
use crate::error_handling::types::{ErrorKind, ProxyError, RemoteError};
use crate::session_management::session::SessionMetadata;
use crate::transfer::types::TransferRequest;

/// Largest JSON body accepted on the control endpoints.
const JSON_BODY_LIMIT: u64 = 64 * 1024;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const CHECKSUM_HEADER: &str = "x-chunk-checksum";

fn with_service(
    service: Arc<ProxyService>,
) -> impl Filter<Extract = (Arc<ProxyService>,), Error = Infallible> + Clone {
    warp::any().map(move || service.clone())
}

/// Token from `Authorization: Bearer ...`. A missing or malformed header yields an empty token,
/// which the service rejects as invalid.
fn bearer_token() -> impl Filter<Extract = (String,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .map(|header: Option<String>| parse_bearer(header.as_deref()).unwrap_or_default())
}

pub fn parse_bearer(header: Option<&str>) -> Option<String> {
    let (scheme, token) = header?.trim().split_once(' ')?;
    let token = token.trim();
    if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() {
        Some(token.to_string())
    } else {
        None
    }
}

pub fn status_for(error: &ProxyError) -> StatusCode {
    if matches!(error, ProxyError::Forbidden) {
        return StatusCode::FORBIDDEN;
    }
    match error.kind() {
        ErrorKind::Caller => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Transient => match error.remote_cause() {
            Some(RemoteError::CommandTimeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            Some(RemoteError::CircuitOpen(_)) | None => StatusCode::SERVICE_UNAVAILABLE,
            Some(_) => StatusCode::BAD_GATEWAY,
        },
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn message_reply(message: String, status: StatusCode) -> reply::Response {
    reply::with_status(reply::json(&ApiError { message }), status).into_response()
}

fn error_reply(error: &ProxyError) -> reply::Response {
    let status = status_for(error);
    if status.is_server_error() {
        warn!("Request failed with {}: {}", status, error);
    } else {
        debug!("Request refused with {}: {}", status, error);
    }
    message_reply(error.to_string(), status)
}

fn json_reply<T: Serialize>(result: Result<T, ProxyError>, status: StatusCode) -> reply::Response {
    match result {
        Ok(value) => reply::with_status(reply::json(&value), status).into_response(),
        Err(e) => error_reply(&e),
    }
}

/// POST /api/sessions
pub fn init_session_route(
    service: Arc<ProxyService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "sessions")
        .and(warp::post())
        .and(warp::header::optional::<String>(USER_ID_HEADER))
        .and(warp::body::content_length_limit(JSON_BODY_LIMIT))
        .and(warp::body::json())
        .and(with_service(service))
        .and_then(
            |user_id: Option<String>, request: InitSessionRequest, service: Arc<ProxyService>| async move {
                let user_id = match user_id.as_deref().map(Uuid::parse_str) {
                    Some(Ok(id)) => id,
                    _ => {
                        return Ok::<_, Rejection>(message_reply(
                            "X-User-Id header must carry a user UUID".to_string(),
                            StatusCode::BAD_REQUEST,
                        ))
                    }
                };
                let credentials = match request.into_credentials() {
                    Ok(credentials) => credentials,
                    Err(message) => {
                        return Ok::<_, Rejection>(message_reply(message, StatusCode::BAD_REQUEST))
                    }
                };
                let result = service
                    .init_session(user_id, credentials)
                    .await
                    .map(SessionResponse::from);
                Ok::<_, Rejection>(json_reply(result, StatusCode::CREATED))
            },
        )
}

/// POST /api/sessions/keepalive
pub fn keep_alive_route(
    service: Arc<ProxyService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "sessions" / "keepalive")
        .and(warp::post())
        .and(bearer_token())
        .and(with_service(service))
        .and_then(|token: String, service: Arc<ProxyService>| async move {
            let result = service
                .keep_alive(&token)
                .await
                .map(|metadata| KeepAliveResponse::from(&metadata));
            Ok::<_, Rejection>(json_reply(result, StatusCode::OK))
        })
}

/// DELETE /api/sessions
pub fn release_session_route(
    service: Arc<ProxyService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "sessions")
        .and(warp::delete())
        .and(bearer_token())
        .and(with_service(service))
        .and_then(|token: String, service: Arc<ProxyService>| async move {
            let res = match service.release(&token).await {
                Ok(()) => reply::with_status(reply::reply(), StatusCode::NO_CONTENT).into_response(),
                Err(e) => error_reply(&e),
            };
            Ok::<_, Rejection>(res)
        })
}

/// POST /api/sessions/exec
pub fn exec_route(
    service: Arc<ProxyService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "sessions" / "exec")
        .and(warp::post())
        .and(bearer_token())
        .and(warp::body::content_length_limit(JSON_BODY_LIMIT))
        .and(warp::body::json())
        .and(with_service(service))
        .and_then(
            |token: String, request: ExecRequest, service: Arc<ProxyService>| async move {
                let result = service
                    .execute(&token, &request.command, request.timeout_ms)
                    .await;
                Ok::<_, Rejection>(json_reply(result, StatusCode::OK))
            },
        )
}

/// GET /api/sessions/files?path=P
pub fn list_directory_route(
    service: Arc<ProxyService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "sessions" / "files")
        .and(warp::get())
        .and(bearer_token())
        .and(warp::query::<FilesQuery>())
        .and(with_service(service))
        .and_then(
            |token: String, query: FilesQuery, service: Arc<ProxyService>| async move {
                let result = service.list_directory(&token, &query.path).await;
                Ok::<_, Rejection>(json_reply(result, StatusCode::OK))
            },
        )
}

/// GET /api/sessions/stream (WebSocket)
///
/// Client text frames `{command, timeoutMs?, commandId?}` start commands; their output comes
/// back as `StreamFrame` JSON frames.
pub fn stream_route(
    service: Arc<ProxyService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "sessions" / "stream")
        .and(warp::ws())
        .and(bearer_token())
        .and(with_service(service))
        .and_then(|ws: Ws, token: String, service: Arc<ProxyService>| async move {
            let res = match service.subscribe_output(&token).await {
                Ok((metadata, frames)) => ws
                    .on_upgrade(move |socket| {
                        stream_session(socket, service, token, metadata, frames)
                    })
                    .into_response(),
                Err(e) => error_reply(&e),
            };
            Ok::<_, Rejection>(res)
        })
}

async fn stream_session(
    socket: WebSocket,
    service: Arc<ProxyService>,
    token: String,
    metadata: SessionMetadata,
    mut frames: broadcast::Receiver<StreamFrame>,
) {
    let session_id = metadata.session_id;
    info!("Streaming socket opened for session {}", session_id);
    let (mut sink, mut incoming) = socket.split();

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Ok(frame) => {
                    if send_frame(&mut sink, &frame).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Streaming socket of session {} skipped {} frames", session_id, skipped);
                }
                Err(RecvError::Closed) => break,
            },
            message = incoming.next() => match message {
                Some(Ok(message)) if message.is_close() => break,
                Some(Ok(message)) => {
                    let Ok(text) = message.to_str() else {
                        continue;
                    };
                    match serde_json::from_str::<StreamRequest>(text) {
                        Ok(request) => spawn_streamed_command(service.clone(), token.clone(), request),
                        Err(e) => {
                            let frame = StreamFrame::Error {
                                command_id: String::new(),
                                message: format!("malformed request: {}", e),
                            };
                            if send_frame(&mut sink, &frame).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    debug!("Streaming socket of session {} failed: {}", session_id, e);
                    break;
                }
                None => break,
            },
        }
    }

    let _ = sink.close().await;
    info!("Streaming socket closed for session {}", session_id);
}

async fn send_frame<S>(sink: &mut S, frame: &StreamFrame) -> Result<(), ()>
where
    S: futures::Sink<Message> + Unpin,
{
    let text = serde_json::to_string(frame).map_err(|e| warn!("Unable to encode frame: {}", e))?;
    sink.send(Message::text(text)).await.map_err(|_| ())
}

fn spawn_streamed_command(service: Arc<ProxyService>, token: String, request: StreamRequest) {
    let command_id = request
        .command_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    tokio::spawn(async move {
        // The outcome reaches the client as an exit or error frame.
        if let Err(e) = service
            .execute_streaming(&token, &request.command, request.timeout_ms, &command_id)
            .await
        {
            debug!("Streamed command {} failed: {}", command_id, e);
        }
    });
}

/// POST /api/transfers
pub fn init_transfer_route(
    service: Arc<ProxyService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "transfers")
        .and(warp::post())
        .and(bearer_token())
        .and(warp::body::content_length_limit(JSON_BODY_LIMIT))
        .and(warp::body::json())
        .and(with_service(service))
        .and_then(
            |token: String, request: TransferRequest, service: Arc<ProxyService>| async move {
                let result = service.init_transfer(&token, request).await;
                Ok::<_, Rejection>(json_reply(result, StatusCode::CREATED))
            },
        )
}

/// GET /api/transfers/:id
pub fn transfer_status_route(
    service: Arc<ProxyService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "transfers" / String)
        .and(warp::get())
        .and(bearer_token())
        .and(with_service(service))
        .and_then(
            |transfer_id: String, token: String, service: Arc<ProxyService>| async move {
                let result = service.transfer_status(&token, &transfer_id).await;
                Ok::<_, Rejection>(json_reply(result, StatusCode::OK))
            },
        )
}

/// GET /api/transfers/:id/chunks
pub fn list_chunks_route(
    service: Arc<ProxyService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "transfers" / String / "chunks")
        .and(warp::get())
        .and(bearer_token())
        .and(with_service(service))
        .and_then(
            |transfer_id: String, token: String, service: Arc<ProxyService>| async move {
                let result = service.list_chunks(&token, &transfer_id).await;
                Ok::<_, Rejection>(json_reply(result, StatusCode::OK))
            },
        )
}

/// PUT /api/transfers/:id/chunks/:index?offset=N
pub fn upload_chunk_route(
    service: Arc<ProxyService>,
    max_chunk_size: u64,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "transfers" / String / "chunks" / u32)
        .and(warp::put())
        .and(bearer_token())
        .and(warp::query::<ChunkQuery>())
        .and(warp::header::optional::<String>(CHECKSUM_HEADER))
        .and(warp::body::content_length_limit(max_chunk_size))
        .and(warp::body::bytes())
        .and(with_service(service))
        .and_then(
            |transfer_id: String,
             chunk_index: u32,
             token: String,
             query: ChunkQuery,
             checksum: Option<String>,
             body: Bytes,
             service: Arc<ProxyService>| async move {
                let result = service
                    .upload_chunk(
                        &token,
                        &transfer_id,
                        chunk_index,
                        query.offset,
                        &body,
                        checksum.as_deref(),
                    )
                    .await;
                Ok::<_, Rejection>(json_reply(result, StatusCode::OK))
            },
        )
}

/// GET /api/transfers/:id/chunks/:index
pub fn download_chunk_route(
    service: Arc<ProxyService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "transfers" / String / "chunks" / u32)
        .and(warp::get())
        .and(bearer_token())
        .and(with_service(service))
        .and_then(
            |transfer_id: String, chunk_index: u32, token: String, service: Arc<ProxyService>| async move {
                let res = match service
                    .download_chunk(&token, &transfer_id, chunk_index)
                    .await
                {
                    Ok(bytes) => reply::with_status(
                        reply::with_header(bytes, "Content-Type", "application/octet-stream"),
                        StatusCode::OK,
                    )
                    .into_response(),
                    Err(e) => error_reply(&e),
                };
                Ok::<_, Rejection>(res)
            },
        )
}

/// POST /api/transfers/:id/cancel
pub fn cancel_transfer_route(
    service: Arc<ProxyService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "transfers" / String / "cancel")
        .and(warp::post())
        .and(bearer_token())
        .and(with_service(service))
        .and_then(
            |transfer_id: String, token: String, service: Arc<ProxyService>| async move {
                let result = service.cancel_transfer(&token, &transfer_id).await;
                Ok::<_, Rejection>(json_reply(result, StatusCode::OK))
            },
        )
}

/// GET /api/host-keys
pub fn list_host_keys_route(
    service: Arc<ProxyService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "host-keys")
        .and(warp::get())
        .and(with_service(service))
        .and_then(|service: Arc<ProxyService>| async move {
            Ok::<_, Rejection>(reply::json(&service.host_keys()))
        })
}

/// DELETE /api/host-keys/:host/:port
pub fn remove_host_key_route(
    service: Arc<ProxyService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "host-keys" / String / u16)
        .and(warp::delete())
        .and(with_service(service))
        .and_then(|host: String, port: u16, service: Arc<ProxyService>| async move {
            let res = if service.remove_host_key(&host, port) {
                reply::with_status(reply::reply(), StatusCode::NO_CONTENT).into_response()
            } else {
                message_reply(
                    format!("No host key stored for {}:{}", host, port),
                    StatusCode::NOT_FOUND,
                )
            };
            Ok::<_, Rejection>(res)
        })
}

/// GET /api/health
pub fn health_route(
    service: Arc<ProxyService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("api" / "health")
        .and(warp::get())
        .and(with_service(service))
        .and_then(|service: Arc<ProxyService>| async move {
            Ok::<_, Rejection>(reply::json(&service.health().await))
        })
}

/// Turns the rejections warp produces itself into the same JSON error shape as the handlers.
pub async fn handle_rejection(rejection: Rejection) -> Result<reply::Response, Infallible> {
    let (status, message) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else if let Some(e) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, format!("Malformed body: {}", e))
    } else if let Some(e) = rejection.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if let Some(e) = rejection.find::<warp::reject::MissingHeader>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if rejection.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Payload too large".to_string())
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else {
        warn!("Unhandled rejection: {:?}", rejection);
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string())
    };
    Ok(message_reply(message, status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_handling::types::{SessionError, TransferError};
    use std::time::Duration;

    #[test]
    fn test_parse_bearer() {
        assert_eq!(parse_bearer(Some("Bearer abc.def")), Some("abc.def".to_string()));
        assert_eq!(parse_bearer(Some("bearer   abc ")), Some("abc".to_string()));
        assert_eq!(parse_bearer(Some("Basic abc")), None);
        assert_eq!(parse_bearer(Some("Bearer ")), None);
        assert_eq!(parse_bearer(None), None);
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                ProxyError::InvalidRequest("x".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (
                ProxyError::Session(SessionError::InvalidToken),
                StatusCode::UNAUTHORIZED,
            ),
            (ProxyError::Forbidden, StatusCode::FORBIDDEN),
            (
                ProxyError::Session(SessionError::NotFound),
                StatusCode::NOT_FOUND,
            ),
            (
                ProxyError::Transfer(TransferError::InvalidState {
                    transfer_id: "t".to_string(),
                    status: "FAILED".to_string(),
                }),
                StatusCode::CONFLICT,
            ),
            (
                ProxyError::Remote(RemoteError::CircuitOpen("exec:h".to_string())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ProxyError::Session(SessionError::CapacityExhausted(1000)),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ProxyError::Remote(RemoteError::CommandTimeout(Duration::from_secs(1))),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                ProxyError::Transfer(TransferError::Remote(RemoteError::ChunkIo(
                    "eof".to_string(),
                ))),
                StatusCode::BAD_GATEWAY,
            ),
            (
                ProxyError::Session(SessionError::Remote(RemoteError::ConnectionFailed {
                    host: "h".to_string(),
                    reason: "refused".to_string(),
                })),
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(status_for(&error), expected, "{}", error);
        }
    }
}
