pub mod jobs;
pub mod sync;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::response::Dispatch;
use crate::state::AppState;
use crate::uws_xml;

/// Create the main router with the full TAP surface
pub fn create_router(app_state: AppState) -> Router {
    // Configure CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(service_info))
        .route("/availability", get(availability))
        .route("/capabilities", get(capabilities))
        .route("/tables", get(tables))
        .route("/sync", get(sync::sync_query).post(sync::sync_query))
        .route("/:job_list", get(jobs::list_jobs).post(jobs::create_job))
        .route(
            "/:job_list/:job_id",
            get(jobs::get_job)
                .post(jobs::post_job)
                .delete(jobs::delete_job),
        )
        .route(
            "/:job_list/:job_id/phase",
            get(jobs::get_phase).post(jobs::post_phase),
        )
        .route(
            "/:job_list/:job_id/executionduration",
            get(jobs::get_execution_duration).post(jobs::post_execution_duration),
        )
        .route(
            "/:job_list/:job_id/destruction",
            get(jobs::get_destruction).post(jobs::post_destruction),
        )
        .route("/:job_list/:job_id/quote", get(jobs::get_quote))
        .route("/:job_list/:job_id/owner", get(jobs::get_owner))
        .route(
            "/:job_list/:job_id/parameters",
            get(jobs::get_parameters).post(jobs::post_parameters),
        )
        .route(
            "/:job_list/:job_id/parameters/:name",
            get(jobs::get_parameter).post(jobs::post_parameter),
        )
        .route("/:job_list/:job_id/results", get(jobs::get_results))
        .route(
            "/:job_list/:job_id/results/:result_id",
            get(jobs::get_result),
        )
        .route("/:job_list/:job_id/error", get(jobs::get_error))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Service info endpoint
async fn service_info() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "name": "TAPIR",
        "version": tapir_core::VERSION,
        "protocol": "TAP",
        "endpoints": ["/sync", "/async", "/tables", "/availability", "/capabilities"]
    }))
}

/// VOSI availability document (always served, even when unavailable)
async fn availability(State(state): State<AppState>) -> Dispatch {
    Dispatch::xml(uws_xml::availability_document(
        state.service.is_available(),
        &state.service.availability_note(),
    ))
}

/// VOSI capabilities document
async fn capabilities(State(state): State<AppState>) -> Dispatch {
    let formats: Vec<(String, String)> = state
        .service
        .formatters()
        .all()
        .iter()
        .map(|f| (f.short_alias().to_string(), f.content_type().to_string()))
        .collect();
    Dispatch::xml(uws_xml::capabilities_document(
        state.service.config(),
        &formats,
    ))
}

/// VOSI tableset document
async fn tables(State(state): State<AppState>) -> Dispatch {
    Dispatch::xml(uws_xml::tables_document(&state.service.metadata().list_tables()))
}
