use actix_web::{Responder, get, web::Data, web::Json};

use crate::db::{Store, StoreStatistics};

#[utoipa::path(
    summary = "Store cache statistics",
    description = "Returns hit/miss counters of the store caches. Consumed by monitoring.",
    responses(
        (status = 200, description = "Current cache counters", body = StoreStatistics),
    ),
    tag = "Statistics",
)]
#[get("/stats")]
pub async fn store_statistics(store: Data<Store>) -> impl Responder {
    Json(store.statistics())
}
