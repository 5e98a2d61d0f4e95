use serde::{Deserialize, Serialize};

use tenantgate_core::permission::{Evaluator, PublicDenial};

fn default_evaluator() -> Evaluator {
    Evaluator::AllOf
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    pub permissions: Vec<String>,
    #[serde(default = "default_evaluator")]
    pub evaluator: Evaluator,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    pub allowed: bool,
    pub cache_hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denial: Option<PublicDenial>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateRequest {
    #[serde(default)]
    pub actor_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateRoleRequest {
    pub role_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateResponse {
    pub removed: usize,
    pub scope: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}
