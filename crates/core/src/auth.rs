//! Session state and its reducer.
//!
//! The session is an explicit value updated only through [`reduce`] with an
//! [`AuthAction`]. Persistence is separate: [`load_auth_state`] and
//! [`persist_auth_state`] move the value in and out of the store under
//! [`AUTH_STATE_KEY`].

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ledger::AUTH_STATE_KEY;
use crate::store::KeyValueStore;

/// Authenticated session as persisted between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthState {
    pub is_authenticated: bool,
    /// Account document returned by the accounts API.
    pub user: Option<serde_json::Value>,
    /// Bearer token for authenticated calls.
    pub token: Option<String>,
    /// Token expiry as reported by the server.
    pub expiry: Option<serde_json::Value>,
}

impl AuthState {
    /// Bearer token, only while authenticated.
    pub fn bearer(&self) -> Option<&str> {
        if self.is_authenticated {
            self.token.as_deref()
        } else {
            None
        }
    }

    /// `user_id` field of the stored account document, if present.
    pub fn user_id(&self) -> Option<String> {
        let id = self.user.as_ref()?.get("user_id")?;
        match id {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Body of a successful login or token refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginPayload {
    pub user: serde_json::Value,
    pub access_token: String,
    #[serde(default)]
    pub expiry: Option<serde_json::Value>,
}

/// Updates that can be applied to an [`AuthState`].
#[derive(Debug, Clone, PartialEq)]
pub enum AuthAction {
    LoginSuccess(LoginPayload),
    Logout,
    SetAuthState(AuthState),
    SetUser(serde_json::Value),
    VerifySuccess(serde_json::Value),
}

/// Pure reducer: compute the next session from the current one.
pub fn reduce(state: &AuthState, action: AuthAction) -> AuthState {
    match action {
        AuthAction::LoginSuccess(payload) => AuthState {
            is_authenticated: true,
            user: Some(payload.user),
            token: Some(payload.access_token),
            expiry: payload.expiry,
        },
        AuthAction::Logout => AuthState::default(),
        AuthAction::SetAuthState(next) => next,
        AuthAction::SetUser(user) | AuthAction::VerifySuccess(user) => AuthState {
            user: Some(user),
            ..state.clone()
        },
    }
}

/// Load the persisted session, or the signed-out default.
pub fn load_auth_state(store: &dyn KeyValueStore) -> Result<AuthState, CoreError> {
    match store.get(AUTH_STATE_KEY)? {
        None => Ok(AuthState::default()),
        Some(raw) => serde_json::from_str(&raw).map_err(|source| CoreError::Corrupt {
            key: AUTH_STATE_KEY.to_string(),
            source,
        }),
    }
}

/// Persist `state`; a signed-out session removes the stored blob.
pub fn persist_auth_state(store: &dyn KeyValueStore, state: &AuthState) -> Result<(), CoreError> {
    if !state.is_authenticated {
        store.remove(AUTH_STATE_KEY)?;
        return Ok(());
    }
    let raw = serde_json::to_string(state)
        .map_err(|e| CoreError::Internal(format!("Failed to encode session: {e}")))?;
    store.set(AUTH_STATE_KEY, &raw)
}
