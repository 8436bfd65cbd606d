use crate::auth;
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::setup::load_settings;
use crate::ipc::helpers::{conn_and_session, db_conn, get_required_str, respond};
use crate::ipc::types::{AppState, Request};
use crate::session::AuthEvent;
use serde_json::json;

fn auth_sign_up(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let email = get_required_str(params, "email")?;
    let Some(password) = params.get("password").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::bad_params("missing password"));
    };
    let settings = load_settings(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let identity = auth::sign_up(conn, &email, password, settings.min_password_length)?;
    tracing::info!(user_id = %identity.user_id, "identity created");
    Ok(json!(identity))
}

fn auth_sign_in(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let email = get_required_str(params, "email")?;
    let Some(password) = params.get("password").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::bad_params("missing password"));
    };
    let (conn, session) = conn_and_session(state)?;
    let identity = auth::verify_credentials(conn, &email, password)?;
    let transition = session.apply(conn, AuthEvent::SignedIn(identity))?;
    let session = session.require()?;
    Ok(json!({
        "session": session.view(),
        "resolved": transition.resolved,
    }))
}

fn auth_refresh(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    let (conn, session) = conn_and_session(state)?;
    let identity = session.require()?.identity.clone();
    let transition = session.apply(conn, AuthEvent::TokenRefreshed(identity))?;
    let session = session.require()?;
    Ok(json!({
        "session": session.view(),
        "resolved": transition.resolved,
    }))
}

fn auth_sign_out(state: &mut AppState) -> Result<serde_json::Value, HandlerErr> {
    // Sign-out needs no profile lookups, so an absent workspace is fine.
    let AppState { db, session, .. } = state;
    match db.as_ref() {
        Some(conn) => {
            session.apply(conn, AuthEvent::SignedOut)?;
        }
        None => session.clear(),
    }
    Ok(json!({ "ok": true }))
}

fn auth_session(state: &AppState) -> serde_json::Value {
    json!({ "session": state.session.current().map(|s| s.view()) })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "auth.signUp" => auth_sign_up(state, &req.params),
        "auth.signIn" => auth_sign_in(state, &req.params),
        "auth.refresh" => auth_refresh(state),
        "auth.signOut" => auth_sign_out(state),
        "auth.session" => Ok(auth_session(state)),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
