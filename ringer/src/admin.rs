//! Read-only HTTP view of a ring worker.
//!
//! | route | body |
//! |---|---|
//! | `GET /ringer` | [`RingStatus`] of this worker |
//! | `GET /ringer/peers` | every member with status, latency and errors |
//! | `GET /ringer/roster` | `{client, roster}` |
//! | `GET /ringer/frames` | HTML page framing the roster of every local worker |

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::RingError;
use crate::member::MemberStatus;
use crate::message::Roster;
use crate::runtime::{RingHandle, RingStatus};

#[derive(Clone)]
struct AdminState {
    ring: RingHandle,
    /// Admin port of worker 0; worker `i` serves on `base_port + i`.
    base_port: u16,
    process_count: usize,
}

pub fn router(ring: RingHandle, base_port: u16, process_count: usize) -> Router {
    Router::new()
        .route("/ringer", get(describe))
        .route("/ringer/peers", get(peers))
        .route("/ringer/roster", get(roster))
        .route("/ringer/frames", get(frames))
        .layer(TraceLayer::new_for_http())
        .with_state(AdminState {
            ring,
            base_port,
            process_count,
        })
}

pub async fn serve(listener: TcpListener, router: Router) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "admin endpoint listening");
    axum::serve(listener, router).await
}

struct AdminError(RingError);

impl From<RingError> for AdminError {
    fn from(err: RingError) -> Self {
        Self(err)
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        (StatusCode::SERVICE_UNAVAILABLE, self.0.to_string()).into_response()
    }
}

#[derive(Serialize)]
struct RosterView {
    client: String,
    roster: Roster,
}

async fn describe(State(state): State<AdminState>) -> Result<Json<RingStatus>, AdminError> {
    Ok(Json(state.ring.status().await?))
}

async fn peers(State(state): State<AdminState>) -> Result<Json<Vec<MemberStatus>>, AdminError> {
    Ok(Json(state.ring.status().await?.members))
}

async fn roster(State(state): State<AdminState>) -> Result<Json<RosterView>, AdminError> {
    Ok(Json(RosterView {
        client: state.ring.name().to_string(),
        roster: state.ring.roster().await?,
    }))
}

async fn frames(State(state): State<AdminState>) -> Html<String> {
    let mut html = String::from("<title>Ringer</title>");
    for index in 0..state.process_count {
        let port = state.base_port as usize + index;
        html.push_str(&format!(
            "<iframe src=\"http://localhost:{port}/ringer/roster\" style=\"width:100%\"></iframe><br>"
        ));
    }
    Html(html)
}
