//! Fixed model catalog. Never consults the admission engine.

use axum::Json;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ModelCatalog {
    pub object: String,
    pub data: Vec<ModelEntry>,
}

fn catalog() -> ModelCatalog {
    ModelCatalog {
        object: "list".to_string(),
        data: vec![
            ModelEntry {
                id: "gpt-3.5-turbo".to_string(),
                object: "model".to_string(),
                created: 1_677_610_602,
                owned_by: "openai".to_string(),
            },
            ModelEntry {
                id: "gpt-4".to_string(),
                object: "model".to_string(),
                created: 1_687_882_411,
                owned_by: "openai".to_string(),
            },
        ],
    }
}

pub async fn models_handler() -> Json<ModelCatalog> {
    Json(catalog())
}
