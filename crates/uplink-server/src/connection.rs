use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, warn};

use libuplink::SessionCreateOptions;
use uplink_protocol::{ErrorCode, Event, Request, Response, ResponseEnvelope, SessionId};

use crate::server::SharedState;

/// Handle a single client connection.
pub async fn handle_client(stream: UnixStream, state: Arc<SharedState>) {
    let (reader, writer) = stream.into_split();
    let reader = BufReader::new(reader);
    let writer = Arc::new(Mutex::new(writer));

    let mut lines = reader.lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("client disconnected");
                break;
            }
            Err(e) => {
                error!("read error: {e}");
                break;
            }
        };

        let request: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                let resp = Response::Error {
                    message: format!("invalid request: {e}"),
                    code: ErrorCode::InvalidRequest,
                };
                let mut w = writer.lock().await;
                let _ = write_response(&mut w, &resp).await;
                continue;
            }
        };

        let response = handle_request(request, &state, &writer).await;

        let mut w = writer.lock().await;
        if let Err(e) = write_response(&mut w, &response).await {
            error!("write error: {e}");
            break;
        }
    }
}

async fn handle_request(
    request: Request,
    state: &Arc<SharedState>,
    writer: &Arc<Mutex<tokio::net::unix::OwnedWriteHalf>>,
) -> Response {
    match request {
        Request::SessionCreate {
            exec,
            args,
            cwd,
            config_dir,
            label,
        } => {
            match state
                .manager
                .create_session(SessionCreateOptions {
                    exec,
                    args,
                    cwd,
                    config_dir,
                    label,
                })
                .await
            {
                Ok(session_id) => Response::Ok {
                    data: Some(serde_json::json!({ "session_id": session_id })),
                },
                Err(e) => error_response(e),
            }
        }

        Request::SessionCancel { session_id } => {
            match state.manager.cancel_session(&session_id).await {
                Ok(()) => Response::Ok { data: None },
                Err(e) => error_response(e),
            }
        }

        Request::SessionList => {
            let sessions = state.manager.list_sessions().await;
            Response::Ok {
                data: Some(serde_json::to_value(&sessions).unwrap_or_default()),
            }
        }

        Request::SessionInfo { session_id } => {
            match state.manager.session_info(&session_id).await {
                Ok(info) => Response::Ok {
                    data: Some(serde_json::to_value(&info).unwrap_or_default()),
                },
                Err(e) => error_response(e),
            }
        }

        Request::PromptAwaiting { session_id } => {
            match state.manager.awaiting(&session_id).await {
                Ok(descriptor) => Response::Ok {
                    data: Some(serde_json::to_value(&descriptor).unwrap_or_default()),
                },
                Err(e) => error_response(e),
            }
        }

        Request::PromptSubmit {
            session_id,
            prompt_id,
            value,
        } => {
            let envelope = ResponseEnvelope { prompt_id, value };
            match state.manager.submit_response(&session_id, envelope).await {
                Ok(()) => Response::Ok { data: None },
                Err(e) => {
                    // Stale answers are dropped by design; tell the client why.
                    debug!(session_id = %session_id, error = %e, "response rejected");
                    error_response(e)
                }
            }
        }

        Request::Subscribe { session_id } => {
            let rx = match state.manager.subscribe(&session_id).await {
                Ok(rx) => rx,
                Err(e) => return error_response(e),
            };

            let writer_clone = Arc::clone(writer);
            let sid = session_id.clone();
            tokio::spawn(async move {
                forward_events(rx, writer_clone, sid).await;
            });

            Response::Ok { data: None }
        }

        Request::DepsResolve => match state.resolver.ensure_all(&state.specs).await {
            Ok(resolved) => Response::Ok {
                data: Some(serde_json::to_value(&resolved).unwrap_or_default()),
            },
            Err(e) => Response::Error {
                message: e.to_string(),
                code: ErrorCode::DependencyFailed,
            },
        },

        Request::DepsList => {
            let resolved = state.resolver.resolved();
            Response::Ok {
                data: Some(serde_json::to_value(&resolved).unwrap_or_default()),
            }
        }
    }
}

fn error_response(err: libuplink::UplinkError) -> Response {
    let (code, message) = err.to_error_code();
    Response::Error { message, code }
}

/// Forward the session's events (plus dependency events, which gate its
/// launch) to a subscribed client.
async fn forward_events(
    mut rx: broadcast::Receiver<Event>,
    writer: Arc<Mutex<tokio::net::unix::OwnedWriteHalf>>,
    session_id: SessionId,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if !event_matches(&event, &session_id) {
                    continue;
                }
                let resp = Response::Event(event);
                let mut w = writer.lock().await;
                if write_response(&mut w, &resp).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(session_id = %session_id, skipped = n, "subscriber lagged");
                // Continue - client missed some events but can catch up
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!(session_id = %session_id, "event bus closed");
                break;
            }
        }
    }
}

fn event_matches(event: &Event, session_id: &SessionId) -> bool {
    match event {
        Event::SessionState { session_id: sid, .. }
        | Event::Output { session_id: sid, .. }
        | Event::PromptReady { session_id: sid, .. }
        | Event::PromptResolved { session_id: sid, .. } => sid == session_id,
        Event::DepProgress { .. } | Event::DepResolved { .. } | Event::DepFailed { .. } => true,
    }
}

async fn write_response(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    response: &Response,
) -> Result<(), std::io::Error> {
    let json = serde_json::to_string(response)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
