use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use super::{
    types::{
        parse_dispenser_set, parse_group_number, CommandResponse, ConnectRequest,
        DeliverRequest, DeliveriesQuery, DispenserRequest, GroupRequest,
    },
    AppState,
};
use crate::{
    error::MachineError,
    protocol::registers::CoffeeType,
    tasks::{run_blocking, spawn_delivery_tracker},
};

const DEFAULT_HISTORY_LIMIT: usize = 50;

type Reply = (StatusCode, Json<CommandResponse>);

/// HTTP status for a failed command.
pub fn status_for(err: &MachineError) -> StatusCode {
    match err {
        _ if err.is_rejection() => StatusCode::BAD_REQUEST,
        MachineError::ConnectionFailed { .. } | MachineError::ConnectionUnavailable { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ if err.is_connection_issue() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(err: &MachineError) -> Reply {
    (status_for(err), Json(CommandResponse::failed(err)))
}

fn bad_body(rejection: JsonRejection) -> Reply {
    log::debug!("rejected request body: {rejection}");
    failure(&MachineError::invalid(format!(
        "Invalid request body: {}",
        rejection.body_text()
    )))
}

fn internal(err: anyhow::Error) -> Reply {
    log::error!("request handler failed: {err}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(CommandResponse {
            success: false,
            message: format!("Internal error: {err}"),
            delivery_id: None,
            result: None,
            error: None,
        }),
    )
}

fn json_value<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

pub async fn deliver(
    State(state): State<AppState>,
    payload: Result<Json<DeliverRequest>, JsonRejection>,
) -> Reply {
    let Json(request) = match payload {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    let group = match parse_group_number(request.group_number.as_ref()) {
        Ok(group) => group,
        Err(err) => return failure(&err),
    };
    let coffee_type = match request.coffee_type.as_deref() {
        Some(name) => match CoffeeType::parse(name) {
            Ok(ct) => ct,
            Err(err) => return failure(&err),
        },
        None => return failure(&MachineError::invalid("coffee_type is required")),
    };

    let controller = state.controller.clone();
    let attempt = match run_blocking(move || controller.deliver(group, coffee_type)).await {
        Ok(attempt) => attempt,
        Err(err) => return internal(err),
    };
    let delivery_id = attempt.record.as_ref().map(|r| r.id);

    match attempt.result {
        Ok(receipt) => {
            if let Some(id) = delivery_id {
                spawn_delivery_tracker(state.controller.clone(), id);
            }
            let response = CommandResponse::ok(receipt.message.clone())
                .with_delivery(delivery_id)
                .with_result(json_value(&receipt));
            (StatusCode::OK, Json(response))
        }
        Err(err) => {
            let (status, Json(response)) = failure(&err);
            (status, Json(response.with_delivery(delivery_id)))
        }
    }
}

pub async fn stop(
    State(state): State<AppState>,
    payload: Result<Json<GroupRequest>, JsonRejection>,
) -> Reply {
    let Json(request) = match payload {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    let group = match parse_group_number(request.group_number.as_ref()) {
        Ok(group) => group,
        Err(err) => return failure(&err),
    };
    let controller = state.controller.clone();
    match run_blocking(move || controller.stop(group)).await {
        Ok(Ok(stopped)) => {
            let response = CommandResponse::ok(format!("Delivery stopped on group {group}"))
                .with_delivery(stopped.map(|r| r.id));
            (StatusCode::OK, Json(response))
        }
        Ok(Err(err)) => failure(&err),
        Err(err) => internal(err),
    }
}

pub async fn purge(
    State(state): State<AppState>,
    payload: Result<Json<GroupRequest>, JsonRejection>,
) -> Reply {
    let Json(request) = match payload {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    let group = match parse_group_number(request.group_number.as_ref()) {
        Ok(group) => group,
        Err(err) => return failure(&err),
    };
    let controller = state.controller.clone();
    match run_blocking(move || controller.purge(group)).await {
        Ok(Ok(())) => (
            StatusCode::OK,
            Json(CommandResponse::ok(format!("Purge started on group {group}"))),
        ),
        Ok(Err(err)) => failure(&err),
        Err(err) => internal(err),
    }
}

#[derive(Debug, Clone, Copy)]
enum Dispenser {
    Water,
    Mat,
}

async fn dispense(
    state: AppState,
    payload: Result<Json<DispenserRequest>, JsonRejection>,
    dispenser: Dispenser,
) -> Reply {
    let Json(request) = match payload {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    let set = match parse_dispenser_set(request.set.as_ref()) {
        Ok(set) => set,
        Err(err) => return failure(&err),
    };
    let controller = state.controller.clone();
    let result = run_blocking(move || match dispenser {
        Dispenser::Water => controller.water(set),
        Dispenser::Mat => controller.mat(set),
    })
    .await;
    let name = match dispenser {
        Dispenser::Water => "Water",
        Dispenser::Mat => "MAT",
    };
    match result {
        Ok(Ok(())) => (
            StatusCode::OK,
            Json(CommandResponse::ok(format!("{name} command sent (set {set})"))),
        ),
        Ok(Err(err)) => failure(&err),
        Err(err) => internal(err),
    }
}

pub async fn water(
    State(state): State<AppState>,
    payload: Result<Json<DispenserRequest>, JsonRejection>,
) -> Reply {
    dispense(state, payload, Dispenser::Water).await
}

pub async fn mat(
    State(state): State<AppState>,
    payload: Result<Json<DispenserRequest>, JsonRejection>,
) -> Reply {
    dispense(state, payload, Dispenser::Mat).await
}

pub async fn connect(
    State(state): State<AppState>,
    payload: Result<Json<ConnectRequest>, JsonRejection>,
) -> Reply {
    // A bare POST without a JSON body reconnects with the current settings.
    let request = match payload {
        Ok(Json(request)) => request,
        Err(JsonRejection::MissingJsonContentType(_)) => ConnectRequest::default(),
        Err(rejection) => return bad_body(rejection),
    };
    let controller = state.controller.clone();
    let result = run_blocking(move || {
        controller.connect(request.port.as_deref(), request.baudrate)
    })
    .await;
    match result {
        Ok(Ok(info)) => {
            let response = CommandResponse::ok(format!("Connected to {}", info.port))
                .with_result(json_value(&info));
            (StatusCode::OK, Json(response))
        }
        Ok(Err(err)) => failure(&err),
        Err(err) => internal(err),
    }
}

pub async fn disconnect(State(state): State<AppState>) -> Reply {
    let controller = state.controller.clone();
    match run_blocking(move || controller.disconnect()).await {
        Ok(()) => (StatusCode::OK, Json(CommandResponse::ok("Disconnected"))),
        Err(err) => internal(err),
    }
}

pub async fn info(State(state): State<AppState>) -> Response {
    let controller = state.controller.clone();
    match run_blocking(move || controller.info()).await {
        Ok(info) => Json(info).into_response(),
        Err(err) => internal(err).into_response(),
    }
}

pub async fn status(State(state): State<AppState>) -> Response {
    let controller = state.controller.clone();
    match run_blocking(move || controller.status()).await {
        Ok(status) => Json(status).into_response(),
        Err(err) => internal(err).into_response(),
    }
}

pub async fn health(State(state): State<AppState>) -> Response {
    let controller = state.controller.clone();
    match run_blocking(move || controller.health()).await {
        Ok(health) => Json(health).into_response(),
        Err(err) => internal(err).into_response(),
    }
}

pub async fn deliveries(
    State(state): State<AppState>,
    Query(query): Query<DeliveriesQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Json(state.controller.deliveries(limit)).into_response()
}

pub async fn delivery(State(state): State<AppState>, Path(id): Path<u64>) -> Response {
    match state.controller.delivery(id) {
        Some(record) => Json(record).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(CommandResponse {
                success: false,
                message: format!("Delivery {id} not found"),
                delivery_id: Some(id),
                result: None,
                error: None,
            }),
        )
            .into_response(),
    }
}
