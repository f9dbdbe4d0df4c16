//! Session, player and score endpoints.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
};
use axum_valid::Valid;
use uuid::Uuid;

use crate::{
    dao::models::MergeOutcome,
    dto::{
        session::{
            AnswerRequest, AnswerResponse, CreateSessionRequest, FlushResponse, JoinSessionRequest,
            PlayerResponse, RoomResponse, ScoreUpdateRequest, ScoreUpdateResponse, SessionSummary,
            TransitionRequest,
        },
        validation::validate_session_code,
    },
    error::AppError,
    state::SharedState,
};

/// Session lifecycle, player and score endpoints.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/sessions", post(create_session))
        .route(
            "/sessions/{code}",
            get(get_session).delete(teardown_session),
        )
        .route("/sessions/{code}/room", get(get_room))
        .route("/sessions/{code}/players", post(join_session))
        .route("/sessions/{code}/players/{id}/score", put(update_score))
        .route("/sessions/{code}/players/{id}/answers", post(record_answer))
        .route("/sessions/{code}/status", post(transition_status))
        .route("/sessions/{code}/reconcile", post(reconcile_session))
        .route("/queue/flush", post(flush_queue))
}

pub(crate) fn checked_code(code: String) -> Result<String, AppError> {
    validate_session_code(&code).map_err(|err| AppError::BadRequest(err.to_string()))?;
    Ok(code)
}

/// Create a waiting session and register its host.
#[utoipa::path(
    post,
    path = "/sessions",
    tag = "sessions",
    request_body = CreateSessionRequest,
    responses(
        (status = 201, description = "Session created", body = SessionSummary),
        (status = 400, description = "Invalid payload"),
        (status = 503, description = "Stores unavailable")
    )
)]
pub async fn create_session(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<CreateSessionRequest>>,
) -> Result<(StatusCode, Json<SessionSummary>), AppError> {
    let (host, settings, quiz_ref) = payload.into_parts();
    let session = state
        .engine()
        .try_create_session(host, settings, quiz_ref)
        .await?;
    Ok((StatusCode::CREATED, Json(session.into())))
}

/// Fetch the authoritative session document.
#[utoipa::path(
    get,
    path = "/sessions/{code}",
    tag = "sessions",
    params(("code" = String, Path, description = "Join code of the session")),
    responses(
        (status = 200, description = "Session", body = SessionSummary),
        (status = 404, description = "Unknown session")
    )
)]
pub async fn get_session(
    State(state): State<SharedState>,
    Path(code): Path<String>,
) -> Result<Json<SessionSummary>, AppError> {
    let code = checked_code(code)?;
    let session = state.engine().try_get_session(&code).await?;
    Ok(Json(session.into()))
}

/// Delete the session with every player row.
#[utoipa::path(
    delete,
    path = "/sessions/{code}",
    tag = "sessions",
    params(("code" = String, Path, description = "Join code of the session")),
    responses(
        (status = 204, description = "Session removed"),
        (status = 404, description = "Unknown session")
    )
)]
pub async fn teardown_session(
    State(state): State<SharedState>,
    Path(code): Path<String>,
) -> Result<StatusCode, AppError> {
    let code = checked_code(code)?;
    if state.engine().try_teardown_session(&code).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("session `{code}`")))
    }
}

/// Session metadata with the merged player list.
#[utoipa::path(
    get,
    path = "/sessions/{code}/room",
    tag = "sessions",
    params(("code" = String, Path, description = "Join code of the session")),
    responses(
        (status = 200, description = "Room view", body = RoomResponse),
        (status = 404, description = "Unknown session")
    )
)]
pub async fn get_room(
    State(state): State<SharedState>,
    Path(code): Path<String>,
) -> Result<Json<RoomResponse>, AppError> {
    let code = checked_code(code)?;
    let room = state.engine().try_get_room(&code).await?;
    Ok(Json(room.into()))
}

/// Join a waiting session. Joining again with the same name replaces the previous player.
#[utoipa::path(
    post,
    path = "/sessions/{code}/players",
    tag = "sessions",
    params(("code" = String, Path, description = "Join code of the session")),
    request_body = JoinSessionRequest,
    responses(
        (status = 201, description = "Player joined", body = PlayerResponse),
        (status = 400, description = "Invalid name or session not accepting players"),
        (status = 404, description = "Unknown session")
    )
)]
pub async fn join_session(
    State(state): State<SharedState>,
    Path(code): Path<String>,
    Valid(Json(payload)): Valid<Json<JoinSessionRequest>>,
) -> Result<(StatusCode, Json<PlayerResponse>), AppError> {
    let code = checked_code(code)?;
    let player = state.engine().try_join_session(&code, payload.into()).await?;
    Ok((StatusCode::CREATED, Json(player.into())))
}

/// Report a player's score and progress; batched unless `immediate` is set.
#[utoipa::path(
    put,
    path = "/sessions/{code}/players/{id}/score",
    tag = "sessions",
    params(
        ("code" = String, Path, description = "Join code of the session"),
        ("id" = String, Path, description = "Identifier of the player")
    ),
    request_body = ScoreUpdateRequest,
    responses(
        (status = 202, description = "Update queued", body = ScoreUpdateResponse),
        (status = 200, description = "Update written", body = ScoreUpdateResponse),
        (status = 404, description = "Unknown session or player")
    )
)]
pub async fn update_score(
    State(state): State<SharedState>,
    Path((code, player_id)): Path<(String, Uuid)>,
    Valid(Json(payload)): Valid<Json<ScoreUpdateRequest>>,
) -> Result<(StatusCode, Json<ScoreUpdateResponse>), AppError> {
    let code = checked_code(code)?;
    let engine = state.engine();

    if !payload.immediate {
        engine
            .enqueue_score_update(&code, player_id, payload.score, payload.questions_answered)
            .await;
        return Ok((StatusCode::ACCEPTED, Json(ScoreUpdateResponse::queued())));
    }

    let outcome = engine
        .try_update_score(&code, player_id, payload.score, payload.questions_answered)
        .await?;
    Ok((
        StatusCode::OK,
        Json(ScoreUpdateResponse::written(outcome == MergeOutcome::Applied)),
    ))
}

/// Append an answer to the player's history.
#[utoipa::path(
    post,
    path = "/sessions/{code}/players/{id}/answers",
    tag = "sessions",
    params(
        ("code" = String, Path, description = "Join code of the session"),
        ("id" = String, Path, description = "Identifier of the player")
    ),
    request_body = AnswerRequest,
    responses(
        (status = 200, description = "Answer processed", body = AnswerResponse),
        (status = 404, description = "Unknown session or player")
    )
)]
pub async fn record_answer(
    State(state): State<SharedState>,
    Path((code, player_id)): Path<(String, Uuid)>,
    Valid(Json(payload)): Valid<Json<AnswerRequest>>,
) -> Result<Json<AnswerResponse>, AppError> {
    let code = checked_code(code)?;
    let outcome = state
        .engine()
        .try_record_answer(&code, player_id, payload.into())
        .await?;
    Ok(Json(AnswerResponse {
        recorded: outcome == MergeOutcome::Applied,
    }))
}

/// Move the session to the requested status.
#[utoipa::path(
    post,
    path = "/sessions/{code}/status",
    tag = "sessions",
    params(("code" = String, Path, description = "Join code of the session")),
    request_body = TransitionRequest,
    responses(
        (status = 200, description = "Status changed", body = SessionSummary),
        (status = 409, description = "Transition not allowed"),
        (status = 404, description = "Unknown session")
    )
)]
pub async fn transition_status(
    State(state): State<SharedState>,
    Path(code): Path<String>,
    Valid(Json(payload)): Valid<Json<TransitionRequest>>,
) -> Result<Json<SessionSummary>, AppError> {
    let code = checked_code(code)?;
    let session = state
        .engine()
        .try_transition_status(&code, payload.status)
        .await?;
    Ok(Json(session.into()))
}

/// Run end-of-game reconciliation again for a finished session.
#[utoipa::path(
    post,
    path = "/sessions/{code}/reconcile",
    tag = "sessions",
    params(("code" = String, Path, description = "Join code of the session")),
    responses(
        (status = 200, description = "Session reconciled", body = SessionSummary),
        (status = 400, description = "Session not finished"),
        (status = 404, description = "Unknown session")
    )
)]
pub async fn reconcile_session(
    State(state): State<SharedState>,
    Path(code): Path<String>,
) -> Result<Json<SessionSummary>, AppError> {
    let code = checked_code(code)?;
    let session = state.engine().reconcile(&code).await?;
    Ok(Json(session.into()))
}

/// Write every queued score update now.
#[utoipa::path(
    post,
    path = "/queue/flush",
    tag = "sessions",
    responses((status = 200, description = "Queue flushed", body = FlushResponse))
)]
pub async fn flush_queue(State(state): State<SharedState>) -> Json<FlushResponse> {
    Json(state.engine().flush_now().await.into())
}
