use std::env;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use log::{info, warn};
use migrator::routes;
use migrator::tasks::{workers, TaskManager};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let debug = env::var("DEBUG").map(|v| !v.is_empty()).unwrap_or(false);
    env_logger::init_from_env(
        env_logger::Env::new().default_filter_or(if debug { "debug" } else { "info" }),
    );

    let port = env::var("HTTP_PORT")
        .unwrap_or_else(|_| String::from("8080"))
        .parse::<u16>()
        .unwrap_or(8080);

    let manager = Arc::new(TaskManager::new(workers::registry()));

    if debug {
        warn!("running in debug mode");
    }
    info!("server opening on {port}");

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(manager.clone()))
            .service(routes::tasks::list_kinds)
            .service(routes::tasks::create_task)
            .service(routes::tasks::get_task)
            .service(routes::tasks::delete_task)
            .service(routes::tasks::list_tasks)
            .service(routes::tasks::list_tasks_of_kind)
            .service(web::scope("/health").service(routes::health::lively))
    })
    .workers(1)
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
