use std::collections::HashMap;
use std::sync::Arc;

use actix_web::{delete, get, post, web, HttpResponse, Responder};
use serde_json::json;

use crate::errors::MigratorError;
use crate::tasks::TaskManager;

/// Treat any non-empty, non-false query value as true, so
/// `?include_completed=1` and `?include_completed=true` both work.
fn truthy(query: &HashMap<String, String>, key: &str) -> bool {
    match query.get(key) {
        Some(v) => !v.is_empty() && v != "false" && v != "0",
        None => false,
    }
}

#[get("/")]
pub async fn list_kinds(manager: web::Data<Arc<TaskManager>>) -> impl Responder {
    HttpResponse::Ok().json(json!({ "tasks": manager.kinds() }))
}

#[post("/tasks/{kind}/{arg}")]
pub async fn create_task(
    manager: web::Data<Arc<TaskManager>>,
    path: web::Path<(String, String)>,
) -> impl Responder {
    let (kind, arg) = path.into_inner();
    match manager.create(&kind, &arg).await {
        Ok(id) => HttpResponse::Created().json(json!({"state": "started", "id": id})),
        Err(MigratorError::TaskExists(_)) => HttpResponse::Conflict().json(json!({
            "error": "task already exists and must be deleted prior to recreating"
        })),
        Err(MigratorError::NotFound(what)) => {
            HttpResponse::NotFound().json(json!({ "error": format!("{what} not found") }))
        }
        Err(e) => HttpResponse::InternalServerError().json(json!({ "error": e.to_string() })),
    }
}

#[get("/tasks/{kind}/{arg}")]
pub async fn get_task(
    manager: web::Data<Arc<TaskManager>>,
    path: web::Path<(String, String)>,
) -> impl Responder {
    let (kind, arg) = path.into_inner();
    match manager.get(&kind, &arg).await {
        Some(view) => HttpResponse::Ok().json(view),
        None => HttpResponse::NotFound().json(json!({"error": "not found"})),
    }
}

#[get("/tasks")]
pub async fn list_tasks(
    manager: web::Data<Arc<TaskManager>>,
    query: web::Query<HashMap<String, String>>,
) -> impl Responder {
    let views = manager.list(None, truthy(&query, "include_completed")).await;
    HttpResponse::Ok().json(views)
}

#[get("/tasks/{kind}")]
pub async fn list_tasks_of_kind(
    manager: web::Data<Arc<TaskManager>>,
    path: web::Path<String>,
    query: web::Query<HashMap<String, String>>,
) -> impl Responder {
    let kind = path.into_inner();
    let views = manager
        .list(Some(&kind), truthy(&query, "include_completed"))
        .await;
    HttpResponse::Ok().json(views)
}

#[delete("/tasks/{kind}/{arg}")]
pub async fn delete_task(
    manager: web::Data<Arc<TaskManager>>,
    path: web::Path<(String, String)>,
) -> impl Responder {
    let (kind, arg) = path.into_inner();
    match manager.delete(&kind, &arg).await {
        Some(state) => HttpResponse::Ok().json(json!({ "state": state })),
        None => {
            HttpResponse::NotFound().json(json!({ "error": format!("{kind}/{arg} not found") }))
        }
    }
}
