//! Gateway HTTP surface

mod clusters;
mod drain;
mod oidc;
mod proxy;
mod refresh;
mod router;
mod server;
mod tokens;

pub use proxy::{BEARER_PROTOCOL_PREFIX, RefreshedToken, process_websocket_protocols};
pub use router::{AppState, create_router};
pub use server::{Gateway, load_contexts};

use axum::response::{IntoResponse, Response};
use tracing::{error, warn};

use crate::Error;

/// Plain-text error response carrying the error's status
fn error_response(err: &Error) -> Response {
    let status = err.status_code();
    if status.is_server_error() {
        error!(error = %err, "Request failed");
    } else {
        warn!(error = %err, "Request rejected");
    }
    (status, err.to_string()).into_response()
}
