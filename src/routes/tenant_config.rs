//! Per-tenant threshold and evidence-weight configuration routes

use crate::error::AppError;
use crate::models::SuccessResponse;
use crate::pipeline::thresholds::{EvidenceWeightConfig, TenantConfig, ThresholdConfig};
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConfigRequest {
    #[serde(default)]
    pub thresholds: Option<ThresholdConfig>,
    #[serde(default)]
    pub weights: Option<EvidenceWeightConfig>,
}

/// Current tenant configuration (defaults until overridden).
pub async fn get_config(
    State(state): State<SharedState>,
    Path(tenant): Path<String>,
) -> Result<Json<SuccessResponse<TenantConfig>>, AppError> {
    let config = state.pipeline.tenant_config(&tenant).await;
    Ok(Json(SuccessResponse::with_data("Configuration", config)))
}

/// Replace parts of the tenant configuration. Omitted sections keep
/// their current values.
pub async fn update_config(
    State(state): State<SharedState>,
    Path(tenant): Path<String>,
    Json(request): Json<UpdateConfigRequest>,
) -> Result<Json<SuccessResponse<TenantConfig>>, AppError> {
    if request.thresholds.is_none() && request.weights.is_none() {
        return Err(AppError::Validation(
            "provide thresholds and/or weights to update".to_string(),
        ));
    }

    let mut config = state.pipeline.tenant_config(&tenant).await;
    if let Some(thresholds) = request.thresholds {
        config.thresholds = thresholds;
    }
    if let Some(weights) = request.weights {
        config.weights = weights;
    }

    let config = state.pipeline.update_tenant_config(&tenant, config).await;
    Ok(Json(SuccessResponse::with_data(
        "Configuration updated",
        config,
    )))
}
