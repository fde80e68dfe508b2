// src/routes.rs

use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware,
    routing::{get, post, put},
};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    handlers::{exam, session},
    state::AppState,
    utils::jwt::auth_middleware,
};

/// Assembles the application router.
///
/// Every route needs a bearer token; attempts are further restricted to
/// their owner inside the handlers.
pub fn create_router(state: AppState) -> Router {
    let origins = [
        HeaderValue::from_static("http://localhost:3000"),
        HeaderValue::from_static("http://127.0.0.1:3000"),
    ];

    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    let exam_routes = Router::new()
        .route("/{exam_id}/attempts", post(exam::start_attempt))
        .route("/{exam_id}/leaderboard", get(exam::get_leaderboard));

    let attempt_routes = Router::new()
        .route(
            "/{id}/session",
            post(session::open_session)
                .get(session::get_session)
                .delete(session::close_session),
        )
        .route("/{id}/questions", get(session::list_questions))
        .route("/{id}/questions/{qid}/visit", post(session::visit_question))
        .route(
            "/{id}/answers/{qid}",
            put(session::set_answer).delete(session::reset_answer),
        )
        .route("/{id}/review/{qid}", post(session::toggle_review))
        .route("/{id}/signals", post(session::report_signal))
        .route("/{id}/warning/dismiss", post(session::dismiss_warning))
        .route("/{id}/submit", post(session::submit))
        .route("/{id}/result", get(session::get_result));

    Router::new()
        .nest("/api/exams", exam_routes)
        .nest("/api/attempts", attempt_routes)
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        // Global Middleware (applied from outside in)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}
