//! Room event stream endpoint.

use axum::{
    Router,
    extract::{Path, State},
    response::sse::Sse,
    routing::get,
};

use crate::{
    error::AppError,
    routes::sessions::checked_code,
    services::sse_service::{self, RoomEventStream},
    state::SharedState,
};

#[utoipa::path(
    get,
    path = "/sessions/{code}/events",
    tag = "sse",
    params(("code" = String, Path, description = "Join code of the session")),
    responses(
        (status = 200, description = "Room events (`room.snapshot`, `room.closed`)", content_type = "text/event-stream", body = String),
        (status = 503, description = "Stores unavailable")
    )
)]
/// Stream room snapshots whenever scores, players or the status change.
pub async fn room_events(
    State(state): State<SharedState>,
    Path(code): Path<String>,
) -> Result<Sse<RoomEventStream>, AppError> {
    let code = checked_code(code)?;
    Ok(sse_service::room_stream(&state, &code).await?)
}

/// Configure the SSE endpoints.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route("/sessions/{code}/events", get(room_events))
}
