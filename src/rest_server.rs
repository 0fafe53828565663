use crate::notifier::unread_cutoff;
use crate::models::NotificationRecord;
use crate::pipeline::FleetContext;
use crate::pool::{ConnectionKey, ConnectionStatus};
use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::Status;
use rocket::serde::{json::Json, Deserialize, Serialize};
use rocket::{get, post, routes, Build, Rocket, State};
use std::sync::Arc;
use tracing::{error, info};

type Context = Arc<FleetContext>;

/// Button press requested by an operator.
#[derive(Deserialize)]
#[serde(crate = "rocket::serde", rename_all = "camelCase")]
struct CommandRequest {
    device_id: String,
    section_name: String,
    topic: String,
    button: String,
}

/// API Response
#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
struct ApiResponse {
    status: String,
    message: String,
}

impl ApiResponse {
    fn success(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            status: "success".to_string(),
            message: message.into(),
        })
    }

    fn error(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            status: "error".to_string(),
            message: message.into(),
        })
    }
}

#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
struct UnreadResponse {
    unread: usize,
}

/// CORS Fairing for Rocket
pub struct Cors;

#[rocket::async_trait]
impl Fairing for Cors {
    fn info(&self) -> Info {
        Info {
            name: "CORS",
            kind: Kind::Response,
        }
    }

    async fn on_response<'r>(&self, _req: &'r rocket::Request<'_>, res: &mut rocket::Response<'r>) {
        res.set_header(rocket::http::Header::new("Access-Control-Allow-Origin", "*"));
        res.set_header(rocket::http::Header::new("Access-Control-Allow-Methods", "GET, POST"));
        res.set_header(rocket::http::Header::new("Access-Control-Allow-Headers", "Content-Type"));
    }
}

#[get("/")]
fn root_handler() -> Json<ApiResponse> {
    ApiResponse::success("fleetlink is running")
}

#[get("/connections")]
async fn connections(ctx: &State<Context>) -> Json<Vec<ConnectionStatus>> {
    Json(ctx.pool.statuses().await)
}

/// Mirrored notifications, newest first.
#[get("/notifications?<limit>")]
async fn notifications(limit: Option<usize>, ctx: &State<Context>) -> Json<Vec<NotificationRecord>> {
    Json(ctx.notifier.recent(limit).await)
}

/// Badge count of notifications newer than `since` (RFC 3339).
#[get("/notifications/unread?<since>")]
async fn unread(since: Option<String>, ctx: &State<Context>) -> Result<Json<UnreadResponse>, Status> {
    let cutoff = unread_cutoff(since.as_deref()).map_err(|_| Status::BadRequest)?;
    Ok(Json(UnreadResponse {
        unread: ctx.notifier.unread_since(cutoff).await,
    }))
}

#[post("/connections/<device>/<section>/reconnect")]
fn reconnect_one(device: &str, section: &str, ctx: &State<Context>) -> Json<ApiResponse> {
    let key = ConnectionKey::new(device, section);
    let context = ctx.inner().clone();
    let message = format!("Reconnecting {}", key);
    tokio::spawn(async move {
        match context.reconnect_one(&key).await {
            Ok(count) => info!("Reconnect of {} opened {} client(s).", key, count),
            Err(e) => error!("Reconnect of {} failed: {}", key, e),
        }
    });
    ApiResponse::success(message)
}

#[post("/connections/reconnect")]
fn reconnect_all(ctx: &State<Context>) -> Json<ApiResponse> {
    let context = ctx.inner().clone();
    tokio::spawn(async move {
        match context.reconnect_all().await {
            Ok(Some(count)) => info!("Reconnect-all opened {} client(s).", count),
            Ok(None) => {}
            Err(e) => error!("Reconnect-all failed: {}", e),
        }
    });
    ApiResponse::success("Reconnecting all connections")
}

#[post("/commands", data = "<payload>")]
async fn command_handler(payload: Json<CommandRequest>, ctx: &State<Context>) -> Json<ApiResponse> {
    let key = ConnectionKey::new(&payload.device_id, &payload.section_name);
    if ctx.publish_button_message(&key, &payload.topic, &payload.button).await {
        ApiResponse::success(format!("Sent '{}' to {}", payload.button, key))
    } else {
        ApiResponse::error(format!("No connected client for {}", key))
    }
}

pub fn build_rocket(ctx: Context) -> Rocket<Build> {
    let figment = rocket::Config::figment().merge(("port", ctx.config.status_port));
    rocket::custom(figment)
        .manage(ctx)
        .mount(
            "/",
            routes![
                root_handler,
                connections,
                notifications,
                unread,
                reconnect_one,
                reconnect_all,
                command_handler
            ],
        )
        .attach(Cors)
}

/// Run the Rocket server until it is shut down.
pub async fn run_rest_server(ctx: Context) {
    if let Err(e) = build_rocket(ctx).launch().await {
        error!("Status server stopped: {}", e);
    }
}
