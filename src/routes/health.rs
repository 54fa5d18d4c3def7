use actix_web::{get, HttpResponse, Responder};

#[get("/lively")]
pub async fn lively() -> impl Responder {
    HttpResponse::Ok().json("ok")
}
