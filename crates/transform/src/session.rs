//! Account session: login, token refresh, logout and the monthly allowance.
//!
//! [`Session`] owns the current [`AuthState`] and routes every change through
//! the reducer in [`geoflip_core::auth`], persisting the result and keeping
//! the bearer token of its [`GeoflipApi`] in sync.

use std::sync::Arc;

use chrono::Datelike;
use geoflip_core::auth::{
    load_auth_state, persist_auth_state, reduce, AuthAction, AuthState, LoginPayload,
};
use geoflip_core::error::CoreError;
use geoflip_core::store::KeyValueStore;
use geoflip_core::types::Timestamp;
use geoflip_events::{EventBus, TrackerEvent};
use serde::Serialize;
use validator::Validate;

use crate::api::{ApiError, GeoflipApi};

/// Transformations a free account may run per calendar month.
pub const MONTHLY_API_CALL_LIMIT: u32 = 30;

/// Email/password pair for `POST /accounts/user/login`.
#[derive(Debug, Clone, Serialize, Validate)]
pub struct Credentials {
    #[validate(email(message = "Enter a valid email address"))]
    pub email: String,
    #[validate(length(min = 1, message = "Password is required"))]
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

/// Errors from session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid credentials: {0}")]
    Invalid(#[from] validator::ValidationErrors),

    #[error("Not signed in")]
    NotSignedIn,

    /// The server refused the token; the local session has been cleared.
    #[error("Session expired, please login again")]
    Expired,

    /// The accounts API rejected the request with a message for the user.
    #[error("{message}")]
    Rejected { status: u16, message: String },

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// The signed-in (or signed-out) user of this client.
pub struct Session {
    api: GeoflipApi,
    store: Arc<dyn KeyValueStore>,
    events: EventBus,
    state: AuthState,
}

impl Session {
    /// Restore the persisted session from `store`.
    pub fn restore(
        api: GeoflipApi,
        store: Arc<dyn KeyValueStore>,
        events: EventBus,
    ) -> Result<Self, CoreError> {
        let state = load_auth_state(store.as_ref())?;
        let api = api.with_token(state.bearer().map(str::to_string));
        Ok(Self {
            api,
            store,
            events,
            state,
        })
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.is_authenticated
    }

    /// API client carrying the current bearer token.
    pub fn api(&self) -> &GeoflipApi {
        &self.api
    }

    /// Apply `action`, persist the resulting state and refresh the token.
    pub fn dispatch(&mut self, action: AuthAction) -> Result<(), CoreError> {
        let next = reduce(&self.state, action);
        persist_auth_state(self.store.as_ref(), &next)?;
        self.api.set_token(next.bearer().map(str::to_string));
        self.state = next;
        Ok(())
    }

    pub async fn login(&mut self, credentials: &Credentials) -> Result<(), SessionError> {
        credentials.validate()?;

        let response = self
            .api
            .http()
            .post(self.url("/accounts/user/login"))
            .json(credentials)
            .send()
            .await
            .map_err(ApiError::from)?;

        let payload: LoginPayload = match GeoflipApi::parse_response(response).await {
            Ok(payload) => payload,
            Err(ApiError::Unauthorized) => {
                return Err(SessionError::Rejected {
                    status: 401,
                    message: "Invalid email or password".into(),
                })
            }
            Err(e) => return Err(rejection(e)),
        };

        self.dispatch(AuthAction::LoginSuccess(payload))?;
        tracing::info!(user_id = ?self.state.user_id(), "Signed in");
        Ok(())
    }

    /// Exchange the current token for a fresh one.
    pub async fn refresh(&mut self) -> Result<(), SessionError> {
        let token = self.bearer()?;

        let response = self
            .api
            .http()
            .post(self.url("/accounts/user/refresh-token"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(ApiError::from)?;

        match GeoflipApi::parse_response::<LoginPayload>(response).await {
            Ok(payload) => {
                self.dispatch(AuthAction::LoginSuccess(payload))?;
                tracing::debug!("Session token refreshed");
                Ok(())
            }
            Err(ApiError::Unauthorized) => self.expire(),
            Err(e) => Err(rejection(e)),
        }
    }

    /// Sign out on the server and locally.
    ///
    /// A 401 still clears the local session. Any other server error leaves
    /// it in place.
    pub async fn logout(&mut self) -> Result<(), SessionError> {
        let token = match self.bearer() {
            Ok(token) => token,
            Err(_) => {
                self.dispatch(AuthAction::Logout)?;
                return Ok(());
            }
        };

        let response = self
            .api
            .http()
            .post(self.url("/accounts/user/logout"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(ApiError::from)?;

        match GeoflipApi::ensure_success(response).await {
            Ok(_) | Err(ApiError::Unauthorized) => {
                self.dispatch(AuthAction::Logout)?;
                tracing::info!("Signed out");
                Ok(())
            }
            Err(e) => Err(rejection(e)),
        }
    }

    /// Transformations left this calendar month.
    ///
    /// A 404 means no usage has been recorded yet. A 401 clears the session
    /// and returns [`SessionError::Expired`].
    pub async fn monthly_usage(&mut self, now: Timestamp) -> Result<u32, SessionError> {
        let token = self.bearer()?;
        let user_id = self.state.user_id().ok_or(SessionError::NotSignedIn)?;

        let url = self.url(&format!(
            "/accounts/usage/monthly/{user_id}/{}/{}",
            now.month(),
            now.year()
        ));
        let response = self
            .api
            .http()
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(ApiError::from)?;

        match GeoflipApi::parse_response::<Vec<serde_json::Value>>(response).await {
            Ok(rows) => Ok(calls_remaining(rows.len())),
            Err(ApiError::Status { status: 404, .. }) => Ok(MONTHLY_API_CALL_LIMIT),
            Err(ApiError::Unauthorized) => self.expire(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to fetch monthly usage");
                Err(e.into())
            }
        }
    }

    // ---- private helpers ----

    /// Clear the local session after the server refused its token.
    fn expire<T>(&mut self) -> Result<T, SessionError> {
        tracing::warn!("Session expired, signing out");
        self.dispatch(AuthAction::Logout)?;
        self.events.publish(TrackerEvent::SessionExpired);
        Err(SessionError::Expired)
    }

    fn bearer(&self) -> Result<String, SessionError> {
        self.state
            .bearer()
            .map(str::to_string)
            .ok_or(SessionError::NotSignedIn)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api.api_url())
    }
}

/// Remaining allowance after `used` recorded calls.
pub fn calls_remaining(used: usize) -> u32 {
    let used = u32::try_from(used).unwrap_or(u32::MAX);
    MONTHLY_API_CALL_LIMIT.saturating_sub(used)
}

/// Turn an error body's `message` into a [`SessionError::Rejected`].
fn rejection(error: ApiError) -> SessionError {
    match error {
        ApiError::Status { status, body } => match server_message(&body) {
            Some(message) => SessionError::Rejected { status, message },
            None => SessionError::Api(ApiError::Status { status, body }),
        },
        other => SessionError::Api(other),
    }
}

fn server_message(body: &str) -> Option<String> {
    let parsed: serde_json::Value = serde_json::from_str(body).ok()?;
    parsed.get("message")?.as_str().map(str::to_string)
}
