use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for Quiz Sync Back.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::sessions::create_session,
        crate::routes::sessions::get_session,
        crate::routes::sessions::teardown_session,
        crate::routes::sessions::get_room,
        crate::routes::sessions::join_session,
        crate::routes::sessions::update_score,
        crate::routes::sessions::record_answer,
        crate::routes::sessions::transition_status,
        crate::routes::sessions::reconcile_session,
        crate::routes::sessions::flush_queue,
        crate::routes::sse::room_events,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::session::CreateSessionRequest,
            crate::dto::session::JoinSessionRequest,
            crate::dto::session::ScoreUpdateRequest,
            crate::dto::session::ScoreUpdateResponse,
            crate::dto::session::AnswerRequest,
            crate::dto::session::AnswerResponse,
            crate::dto::session::TransitionRequest,
            crate::dto::session::PlayerResponse,
            crate::dto::session::RoomPlayer,
            crate::dto::session::RoomResponse,
            crate::dto::session::PlayerResultSummary,
            crate::dto::session::SessionSummary,
            crate::dto::session::FlushResponse,
            crate::dto::sse::RoomClosedEvent,
            crate::dao::models::SessionStatus,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "sessions", description = "Session lifecycle, players and scores"),
        (name = "sse", description = "Server-sent events streams"),
    )
)]
/// OpenAPI document served at `/api-doc/openapi.json`.
pub struct ApiDoc;
