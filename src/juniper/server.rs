use actix_web::{HttpResponse, Responder, get, post, web};
use railflow::{CycleOutcome, OptimizationEngine, SkipReason};
use serde::{Deserialize, Serialize};

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(get_state)
        .service(get_schedules)
        .service(post_start)
        .service(post_stop)
        .service(post_refresh)
        .service(post_ai);
}

#[derive(Serialize)]
struct ControlResponse {
    changed: bool,
    is_polling: bool,
}

#[derive(Serialize)]
struct RefreshResponse {
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[derive(Deserialize)]
struct AiToggle {
    enabled: bool,
}

#[get("/state")]
async fn get_state(engine: web::Data<OptimizationEngine>) -> impl Responder {
    HttpResponse::Ok().json(engine.state())
}

#[get("/schedules")]
async fn get_schedules(engine: web::Data<OptimizationEngine>) -> impl Responder {
    match web::block(move || engine.saved_schedules()).await {
        Ok(Ok(saved)) => HttpResponse::Ok().json(saved),
        Ok(Err(e)) => HttpResponse::InternalServerError().body(e.to_string()),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

#[post("/start")]
async fn post_start(engine: web::Data<OptimizationEngine>) -> impl Responder {
    let changed = engine.start();
    HttpResponse::Ok().json(ControlResponse {
        changed,
        is_polling: engine.is_polling(),
    })
}

#[post("/stop")]
async fn post_stop(engine: web::Data<OptimizationEngine>) -> impl Responder {
    let changed = engine.stop();
    HttpResponse::Ok().json(ControlResponse {
        changed,
        is_polling: false,
    })
}

#[post("/refresh")]
async fn post_refresh(engine: web::Data<OptimizationEngine>) -> impl Responder {
    let response = match engine.refresh().await {
        CycleOutcome::Completed(schedule) => RefreshResponse {
            outcome: "completed",
            detail: Some(format!("{} trains scheduled", schedule.len())),
        },
        CycleOutcome::Skipped(SkipReason::InFlight) => RefreshResponse {
            outcome: "skipped",
            detail: Some("optimization in progress".to_string()),
        },
        CycleOutcome::Skipped(SkipReason::TooSoon) => RefreshResponse {
            outcome: "skipped",
            detail: Some("too soon after the previous cycle".to_string()),
        },
        CycleOutcome::Skipped(SkipReason::Stopped) => RefreshResponse {
            outcome: "skipped",
            detail: Some("engine stopped".to_string()),
        },
        CycleOutcome::Failed(message) => RefreshResponse {
            outcome: "failed",
            detail: Some(message),
        },
        CycleOutcome::Cancelled => RefreshResponse {
            outcome: "cancelled",
            detail: None,
        },
    };

    HttpResponse::Ok().json(response)
}

#[post("/ai")]
async fn post_ai(
    engine: web::Data<OptimizationEngine>,
    body: web::Json<AiToggle>,
) -> impl Responder {
    let effective = engine.set_ai_enabled(body.enabled);
    HttpResponse::Ok().json(serde_json::json!({ "use_ai": effective }))
}
