//! Session-cookie authentication for the HTTP facade.
//!
//! Sessions are in-memory; a bridge restart logs everyone out. Mutating
//! endpoints require a session only when a web password is configured.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use rand::distr::Alphanumeric;

pub const SESSION_COOKIE: &str = "pdubridge_session";
const SESSION_TTL: Duration = Duration::from_secs(12 * 3600);
const TOKEN_LEN: usize = 32;

pub struct SessionStore {
    sessions: Mutex<HashMap<String, Instant>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Create a new session and return its token.
    pub fn create(&self) -> String {
        let token: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();

        let mut sessions = self.sessions.lock().unwrap();
        sessions.retain(|_, created| created.elapsed() < SESSION_TTL);
        sessions.insert(token.clone(), Instant::now());
        token
    }

    pub fn verify(&self, token: &str) -> bool {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(token)
            .is_some_and(|created| created.elapsed() < SESSION_TTL)
    }

    pub fn revoke(&self, token: &str) {
        self.sessions.lock().unwrap().remove(token);
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the session token from a Cookie header value.
pub fn session_from_cookies(cookie_header: &str) -> Option<&str> {
    cookie_header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then_some(value)
    })
}
