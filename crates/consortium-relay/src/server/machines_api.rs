//! Machine registration and read endpoints.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::events::{EmitParams, EventName, RecipientFilter, UpdateBody, UpdateEnvelope, VersionedValue};
use crate::storage::{unix_timestamp_ms, Machine};

use super::extract::authenticate;
use super::AppState;

/// A machine as returned over HTTP: all stored fields plus `activeAt`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiMachine {
    #[serde(flatten)]
    machine: Machine,
    active_at: i64,
}

impl From<Machine> for ApiMachine {
    fn from(machine: Machine) -> Self {
        let active_at = machine.last_active_at;
        Self { machine, active_at }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMachineRequest {
    pub id: String,
    pub metadata: String,
    #[serde(default)]
    pub daemon_state: Option<String>,
    #[serde(default)]
    pub data_encryption_key: Option<String>,
}

/// `POST /v1/machines`
///
/// Idempotent on `(account, id)`. A fresh registration notifies the
/// dashboards with `new-machine` and then the machine's own daemon
/// connection with `update-machine`, so a daemon that just registered
/// receives its initial metadata.
pub async fn create_machine(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateMachineRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let account_id = authenticate(&state, &headers).await?;

    let (machine, created_seq) = state
        .db
        .create_machine(
            &account_id,
            &request.id,
            &request.metadata,
            request.daemon_state.as_deref(),
            request.data_encryption_key.as_deref(),
        )
        .await
        .map_err(|e| {
            error!(error = %e, "Machine registration failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    if let Some(seq) = created_seq {
        info!(account_id = %account_id, machine_id = %machine.id, "Machine registered");

        let envelope = UpdateEnvelope::new(
            seq,
            UpdateBody::NewMachine {
                machine: machine.clone(),
            },
            unix_timestamp_ms(),
        );
        state
            .router
            .emit(EmitParams {
                account_id: account_id.clone(),
                event: EventName::Update,
                payload: serde_json::to_value(&envelope).unwrap_or_default(),
                filter: RecipientFilter::UserScopedOnly,
                skip_connection: None,
            })
            .await;

        match state.db.allocate_account_seq(&account_id).await {
            Ok(seq) => {
                let envelope = UpdateEnvelope::new(
                    seq,
                    UpdateBody::UpdateMachine {
                        machine_id: machine.id.clone(),
                        metadata: Some(VersionedValue {
                            value: Some(machine.metadata.clone()),
                            version: machine.metadata_version,
                        }),
                        daemon_state: None,
                    },
                    unix_timestamp_ms(),
                );
                state
                    .router
                    .emit(EmitParams {
                        account_id: account_id.clone(),
                        event: EventName::Update,
                        payload: serde_json::to_value(&envelope).unwrap_or_default(),
                        filter: RecipientFilter::MachineScoped(machine.id.clone()),
                        skip_connection: None,
                    })
                    .await;
            }
            Err(e) => error!(error = %e, "Seq allocation failed after machine create"),
        }
    }

    Ok(Json(
        serde_json::json!({ "machine": ApiMachine::from(machine) }),
    ))
}

/// `GET /v1/machines`
pub async fn list_machines(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let account_id = authenticate(&state, &headers).await?;

    let machines = state.db.list_machines(&account_id).await.map_err(|e| {
        error!(error = %e, "Machine listing failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let machines: Vec<ApiMachine> = machines.into_iter().map(ApiMachine::from).collect();
    Ok(Json(serde_json::json!({ "machines": machines })))
}

/// `GET /v1/machines/:id`
pub async fn get_machine(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(machine_id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let account_id = authenticate(&state, &headers).await?;

    let machine = state
        .db
        .get_machine(&account_id, &machine_id)
        .await
        .map_err(|e| {
            error!(error = %e, "Machine lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(
        serde_json::json!({ "machine": ApiMachine::from(machine) }),
    ))
}
