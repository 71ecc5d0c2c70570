pub mod config;
pub mod controller;
pub mod error;
pub mod store;

use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use santa_core::{Assignment, Comment, Matcher, Participant, ParticipantId, Phase, Restriction, Wish};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::controller::{AdminList, AssignmentCard, Controller, Notification, Status};
use crate::error::SantaError;
use crate::store::{Store, StoreError};

pub const REQUESTER_HEADER: &str = "x-participant-id";

#[derive(Clone)]
pub struct AppState {
    controller: Arc<Controller>,
}

impl AppState {
    pub fn new(controller: Controller) -> Self {
        Self {
            controller: Arc::new(controller),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, StoreError> {
        let store = match &config.store_path {
            Some(path) => Store::open_file(path)?,
            None => Store::in_memory(),
        };
        let controller = Controller::new(
            store,
            AdminList::new(config.admins.iter().cloned()),
            Matcher::new(config.max_attempts),
        );
        Ok(Self::new(controller))
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/participants", get(list_participants))
        .route(
            "/participants/:id",
            get(get_participant)
                .put(put_participant)
                .delete(delete_participant),
        )
        .route("/restrictions", get(list_restrictions).post(add_restriction))
        .route(
            "/restrictions/:subject/:forbidden",
            delete(remove_restriction),
        )
        .route("/game/status", get(game_status))
        .route("/game/generate", post(generate))
        .route("/game/reveal", post(reveal))
        .route("/game/reset", post(reset))
        .route("/game/clear", post(clear_all))
        .route("/game/assignment", get(my_assignment))
        .route("/game/assignments", get(all_assignments))
        .route(
            "/wishes/:id",
            get(get_wish).put(put_wish).delete(delete_wish),
        )
        .route(
            "/comments/:receiver",
            get(list_comments).post(add_comment).delete(delete_comment),
        )
        .route("/ws/:participant_id", get(ws_handler))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or empty x-participant-id header")]
    MissingRequester,

    #[error(transparent)]
    Santa(#[from] SantaError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::MissingRequester => StatusCode::UNAUTHORIZED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Santa(err) => match err {
                SantaError::InvalidIdentifier(_)
                | SantaError::InvalidInput(_)
                | SantaError::SelfRestriction
                | SantaError::SelfComment
                | SantaError::InsufficientParticipants { .. } => StatusCode::BAD_REQUEST,
                SantaError::NotAuthorized => StatusCode::FORBIDDEN,
                SantaError::ParticipantNotFound(_)
                | SantaError::RestrictionNotFound { .. }
                | SantaError::AssignmentNotFound(_) => StatusCode::NOT_FOUND,
                SantaError::NoValidMatchingFound { .. }
                | SantaError::DuplicateRestriction { .. }
                | SantaError::NotGenerated
                | SantaError::NotRevealed
                | SantaError::GameLocked => StatusCode::CONFLICT,
                SantaError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(%status, err = %self, "Request failed");
        } else {
            debug!(%status, err = %self, "Request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn requester(headers: &HeaderMap) -> ApiResult<ParticipantId> {
    headers
        .get(REQUESTER_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| ParticipantId::new(raw).ok())
        .ok_or(ApiError::MissingRequester)
}

async fn run<T, F>(state: &AppState, op: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Controller) -> crate::error::Result<T> + Send + 'static,
{
    let controller = state.controller.clone();
    tokio::task::spawn_blocking(move || op(&controller))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
        .map_err(ApiError::from)
}

// ---- participants ----

#[derive(Debug, Deserialize)]
struct ParticipantBody {
    display_name: String,
    handle: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ParticipantQuery {
    handle: Option<String>,
}

async fn list_participants(
    State(state): State<AppState>,
    Query(query): Query<ParticipantQuery>,
) -> ApiResult<Response> {
    match query.handle {
        Some(handle) => run(&state, move |c| c.participant_by_handle(&handle))
            .await
            .map(|participant| Json(participant).into_response()),
        None => run(&state, |c| c.participants())
            .await
            .map(|all| Json(all).into_response()),
    }
}

async fn get_participant(
    State(state): State<AppState>,
    Path(id): Path<ParticipantId>,
) -> ApiResult<Json<Participant>> {
    run(&state, move |c| c.participant(&id)).await.map(Json)
}

async fn put_participant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ParticipantId>,
    Json(body): Json<ParticipantBody>,
) -> ApiResult<Json<Participant>> {
    let requester = requester(&headers)?;
    run(&state, move |c| {
        c.add_participant(&requester, &id, &body.display_name, body.handle.as_deref())
    })
    .await
    .map(Json)
}

async fn delete_participant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ParticipantId>,
) -> ApiResult<StatusCode> {
    let requester = requester(&headers)?;
    run(&state, move |c| c.remove_participant(&requester, &id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- restrictions ----

#[derive(Debug, Deserialize)]
struct RestrictionBody {
    subject: Option<ParticipantId>,
    forbidden: ParticipantId,
}

async fn list_restrictions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<Restriction>>> {
    let requester = requester(&headers)?;
    run(&state, move |c| c.restrictions(&requester)).await.map(Json)
}

async fn add_restriction(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RestrictionBody>,
) -> ApiResult<(StatusCode, Json<Restriction>)> {
    let requester = requester(&headers)?;
    let subject = body.subject.unwrap_or_else(|| requester.clone());
    let restriction = run(&state, move |c| {
        c.add_restriction(&requester, &subject, &body.forbidden)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(restriction)))
}

async fn remove_restriction(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((subject, forbidden)): Path<(ParticipantId, ParticipantId)>,
) -> ApiResult<StatusCode> {
    let requester = requester(&headers)?;
    run(&state, move |c| c.remove_restriction(&requester, &subject, &forbidden)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- game ----

#[derive(Debug, Deserialize)]
struct GenerateQuery {
    seed: Option<u64>,
}

async fn game_status(State(state): State<AppState>) -> ApiResult<Json<Status>> {
    run(&state, |c| c.status()).await.map(Json)
}

async fn generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<GenerateQuery>,
) -> ApiResult<Json<Status>> {
    let requester = requester(&headers)?;
    run(&state, move |c| c.generate(&requester, query.seed))
        .await
        .map(Json)
}

async fn reveal(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Status>> {
    let requester = requester(&headers)?;
    run(&state, move |c| c.reveal(&requester)).await.map(Json)
}

async fn reset(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Status>> {
    let requester = requester(&headers)?;
    run(&state, move |c| c.reset(&requester)).await.map(Json)
}

async fn clear_all(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<StatusCode> {
    let requester = requester(&headers)?;
    run(&state, move |c| c.clear_all(&requester)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn my_assignment(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<AssignmentCard>> {
    let requester = requester(&headers)?;
    run(&state, move |c| c.assignment_for(&requester))
        .await
        .map(Json)
}

async fn all_assignments(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Assignment>> {
    let requester = requester(&headers)?;
    run(&state, move |c| c.assignments(&requester)).await.map(Json)
}

// ---- wishes ----

#[derive(Debug, Deserialize)]
struct TextBody {
    text: String,
}

async fn get_wish(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ParticipantId>,
) -> ApiResult<Json<Option<Wish>>> {
    let requester = requester(&headers)?;
    run(&state, move |c| c.wish(&requester, &id)).await.map(Json)
}

async fn put_wish(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ParticipantId>,
    Json(body): Json<TextBody>,
) -> ApiResult<Json<Wish>> {
    let requester = requester(&headers)?;
    run(&state, move |c| c.set_wish(&requester, &id, &body.text))
        .await
        .map(Json)
}

async fn delete_wish(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ParticipantId>,
) -> ApiResult<StatusCode> {
    let requester = requester(&headers)?;
    run(&state, move |c| c.delete_wish(&requester, &id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- gift hints ----

async fn list_comments(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(receiver): Path<ParticipantId>,
) -> ApiResult<Json<Vec<Comment>>> {
    let requester = requester(&headers)?;
    run(&state, move |c| c.comments(&requester, &receiver))
        .await
        .map(Json)
}

async fn add_comment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(receiver): Path<ParticipantId>,
    Json(body): Json<TextBody>,
) -> ApiResult<(StatusCode, Json<Comment>)> {
    let requester = requester(&headers)?;
    let comment = run(&state, move |c| c.add_comment(&requester, &receiver, &body.text)).await?;
    Ok((StatusCode::CREATED, Json(comment)))
}

async fn delete_comment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(receiver): Path<ParticipantId>,
) -> ApiResult<StatusCode> {
    let requester = requester(&headers)?;
    run(&state, move |c| c.delete_comment(&requester, &receiver)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- delivery ----

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Status(Status),
    Assignment(AssignmentCard),
    Error { message: String },
}

async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(participant): Path<ParticipantId>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if let Err(err) = authorize_delivery(&state, &headers, &participant).await {
        return err.into_response();
    }
    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| handle_socket(socket, state, participant)),
        Err(rejection) => rejection.into_response(),
    }
}

// Only a registered participant may open their own delivery socket.
async fn authorize_delivery(
    state: &AppState,
    headers: &HeaderMap,
    participant: &ParticipantId,
) -> ApiResult<()> {
    let requester = requester(headers)?;
    if &requester != participant {
        return Err(SantaError::NotAuthorized.into());
    }
    run(state, move |c| c.participant(&requester).map(|_| ())).await
}

async fn snapshot(state: &AppState, participant: &ParticipantId) -> Vec<ServerMessage> {
    let participant = participant.clone();
    let loaded = run(state, move |c| {
        let status = c.status()?;
        let card = (status.phase == Phase::Revealed).then(|| c.assignment_for(&participant));
        Ok((status, card))
    })
    .await;

    let (status, card) = match loaded {
        Ok(loaded) => loaded,
        Err(err) => {
            return vec![ServerMessage::Error {
                message: err.to_string(),
            }]
        }
    };

    let mut messages = vec![ServerMessage::Status(status)];
    if let Some(card) = card {
        messages.push(match card {
            Ok(card) => ServerMessage::Assignment(card),
            Err(err) => ServerMessage::Error {
                message: err.to_string(),
            },
        });
    }
    messages
}

async fn send_all(
    sender: &mut SplitSink<WebSocket, Message>,
    messages: Vec<ServerMessage>,
) -> Result<(), axum::Error> {
    for message in messages {
        match serde_json::to_string(&message) {
            Ok(text) => sender.send(Message::Text(text)).await?,
            Err(err) => warn!(%err, "Dropping unserializable message"),
        }
    }
    Ok(())
}

async fn handle_socket(stream: WebSocket, state: AppState, participant: ParticipantId) {
    let (mut sender, mut receiver) = stream.split();
    let mut events = state.controller.subscribe();

    debug!(%participant, "Delivery socket opened");
    if send_all(&mut sender, snapshot(&state, &participant).await)
        .await
        .is_err()
    {
        return;
    }

    let mut send_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(Notification::PhaseChanged { phase }) => {
                    debug!(%participant, ?phase, "Pushing phase change");
                    if send_all(&mut sender, snapshot(&state, &participant).await)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%participant, skipped, "Delivery socket lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Inbound frames are ignored; reading them notices the close.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}
