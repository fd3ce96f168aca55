use actix_web::{Result, route, web::Json};
use serde_json::{Value, json};

#[route("/health", method = "GET")]
pub async fn health_endpoint() -> Result<Json<Value>> {
    log::trace!("Healthy");
    Ok(Json(json!({"healthy": true})))
}
