use actix_cors::Cors;
use actix_web::{get, post, web, App, HttpResponse, HttpServer, Responder};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

use review_harvest_lib::distributor::partition;
use review_harvest_lib::job_manager::{Control, JobManager};
use review_harvest_lib::{logger, HarvestConfig, TargetSet};

struct AppState {
    config: HarvestConfig,
    run: Mutex<Option<Arc<JobManager>>>,
}

impl AppState {
    fn current(&self) -> Option<Arc<JobManager>> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[derive(Deserialize)]
struct StartRun {
    workers: Option<usize>,
}

#[get("/api/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json("Server is running")
}

#[post("/api/runs")]
async fn start_run(body: web::Json<StartRun>, data: web::Data<AppState>) -> impl Responder {
    let mut guard = data.run.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(run) = guard.as_ref() {
        if !run.is_finished() {
            return HttpResponse::Conflict().json(serde_json::json!({
                "status": "error",
                "message": format!("run {} is still in progress", run.run_id),
            }));
        }
    }

    let config = &data.config;
    let target_set = match TargetSet::load(config.targets_path()) {
        Ok(t) => t,
        Err(e) => {
            return HttpResponse::BadRequest().json(serde_json::json!({
                "status": "error",
                "message": format!("cannot load targets: {}", e),
            }))
        }
    };
    let workers = body.workers.unwrap_or(config.worker_count);
    let started = partition(&target_set, workers).and_then(|assignment| {
        assignment.verify(&target_set)?;
        assignment.write_partitions(&config.partition_dir())?;
        JobManager::start(Uuid::new_v4().to_string(), config, &assignment)
    });

    match started {
        Ok(manager) => {
            let run_id = manager.run_id.clone();
            *guard = Some(Arc::new(manager));
            HttpResponse::Ok().json(serde_json::json!({
                "status": "success",
                "run_id": run_id,
                "workers": workers,
                "targets": target_set.len(),
            }))
        }
        Err(e) => HttpResponse::BadRequest().json(serde_json::json!({
            "status": "error",
            "message": e.to_string(),
        })),
    }
}

#[get("/api/status")]
async fn get_statuses(data: web::Data<AppState>) -> impl Responder {
    match data.current() {
        Some(run) => HttpResponse::Ok().json(serde_json::json!({
            "run_id": run.run_id,
            "finished": run.is_finished(),
            "workers": run.statuses(),
        })),
        None => HttpResponse::NotFound().json("No run started"),
    }
}

#[get("/api/status/{worker}")]
async fn get_status(path: web::Path<usize>, data: web::Data<AppState>) -> impl Responder {
    let worker = path.into_inner();
    match data.current().and_then(|run| run.status(worker)) {
        Some(status) => HttpResponse::Ok().json(status),
        None => HttpResponse::NotFound().json("Worker not found"),
    }
}

#[get("/api/blocked")]
async fn get_blocked(data: web::Data<AppState>) -> impl Responder {
    let blocked: Vec<serde_json::Value> = data
        .current()
        .map(|run| run.blocked())
        .unwrap_or_default()
        .into_iter()
        .map(|(worker, employers)| serde_json::json!({ "worker": worker, "employers": employers }))
        .collect();
    HttpResponse::Ok().json(blocked)
}

#[post("/api/workers/{worker}/resume/{employer_id}")]
async fn resume_employer(path: web::Path<(usize, String)>, data: web::Data<AppState>) -> impl Responder {
    let (worker, employer_id) = path.into_inner();
    let resumed = data
        .current()
        .map(|run| run.signal_resume(worker, &employer_id))
        .unwrap_or(false);
    if resumed {
        HttpResponse::Ok().json(format!("Resumed {}", employer_id))
    } else {
        HttpResponse::NotFound().json(format!("Worker {} is not blocked on {}", worker, employer_id))
    }
}

#[post("/api/workers/{worker}/stop")]
async fn stop_worker(path: web::Path<usize>, data: web::Data<AppState>) -> impl Responder {
    let worker = path.into_inner();
    let stopped = data
        .current()
        .map(|run| run.send_control(worker, Control::Stop))
        .unwrap_or(false);
    if stopped {
        HttpResponse::Ok().json("Worker stopping")
    } else {
        HttpResponse::NotFound().json("Worker not found")
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    logger::init();

    let config_path = std::env::var_os("HARVEST_CONFIG").map(PathBuf::from);
    let config = HarvestConfig::load_or_default(config_path.as_deref())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
    let bind = std::env::var("HARVEST_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    let state = web::Data::new(AppState {
        config,
        run: Mutex::new(None),
    });

    log::info!("Starting operator server at http://{}", bind);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header();

        App::new()
            .wrap(cors)
            .app_data(state.clone())
            .service(health_check)
            .service(start_run)
            .service(get_statuses)
            .service(get_status)
            .service(get_blocked)
            .service(resume_employer)
            .service(stop_worker)
    })
    .bind(bind)?
    .run()
    .await
}
