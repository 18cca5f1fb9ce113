//! Shared application state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use crate::auth::AuthGate;
use crate::config::Settings;
use crate::csrf::CsrfGuard;
use crate::notifier::{Event, Notifier, PresenceEvent};
use crate::orchestrator::Orchestrator;
use crate::rate_limit::RateLimiter;
use crate::roster::Roster;
use crate::runtime::ContainerRuntime;
use crate::session::{Session, SessionGateway, SessionStore};

/// Open realtime channels: user id to per-session channel counts.
type OpenChannels = HashMap<String, HashMap<String, usize>>;

/// Handles to every component, cloned into each request.
#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionGateway,
    pub csrf: CsrfGuard,
    pub strict_limiter: Arc<RateLimiter>,
    pub read_limiter: Arc<RateLimiter>,
    pub auth: AuthGate,
    pub roster: Arc<dyn Roster>,
    pub orchestrator: Arc<Orchestrator>,
    pub notifier: Arc<Notifier>,
    pub trust_forwarded_for: bool,
    channels: Arc<Mutex<OpenChannels>>,
}

impl AppState {
    pub fn new(
        settings: &Settings,
        store: Arc<dyn SessionStore>,
        runtime: Arc<dyn ContainerRuntime>,
        roster: Arc<dyn Roster>,
    ) -> Self {
        let sessions = SessionGateway::new(store, settings.session_ttl, settings.store_timeout);
        let auth = AuthGate::new(roster.clone());
        let notifier = Arc::new(Notifier::new(settings.event_queue));
        let orchestrator = Arc::new(Orchestrator::new(
            settings.orchestrator.clone(),
            runtime,
            roster.clone(),
            auth.clone(),
            notifier.clone(),
        ));
        Self {
            csrf: CsrfGuard::new(sessions.clone()),
            sessions,
            strict_limiter: Arc::new(RateLimiter::new("strict", settings.strict_rate)),
            read_limiter: Arc::new(RateLimiter::new("read", settings.read_rate)),
            auth,
            roster,
            orchestrator,
            notifier,
            trust_forwarded_for: settings.trust_forwarded_for,
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Track a realtime channel opening or closing. The session's online
    /// flag follows its own channels; classrooms hear about the user only
    /// when the first channel opens or the last one closes.
    pub async fn set_presence(&self, session: &Session, online: bool) {
        let (session_changed, user_changed) = {
            let mut channels = self.channels.lock().await;
            if online {
                let per_session = channels.entry(session.user_id.clone()).or_default();
                let first_for_user = per_session.is_empty();
                let count = per_session.entry(session.id.clone()).or_insert(0);
                *count += 1;
                (*count == 1, first_for_user)
            } else {
                let Some(per_session) = channels.get_mut(&session.user_id) else {
                    return;
                };
                let session_closed = match per_session.get_mut(&session.id) {
                    Some(count) if *count > 1 => {
                        *count -= 1;
                        false
                    }
                    Some(_) => {
                        per_session.remove(&session.id);
                        true
                    }
                    None => return,
                };
                let user_gone = per_session.is_empty();
                if user_gone {
                    channels.remove(&session.user_id);
                }
                (session_closed, user_gone)
            }
        };

        if session_changed {
            if let Err(err) = self.sessions.set_online(&session.id, online).await {
                warn!(user = %session.user_id, error = %err, "Failed to record presence");
            }
        }
        if !user_changed {
            return;
        }
        let classrooms = match self.roster.classrooms_of(&session.user_id).await {
            Ok(memberships) => memberships.into_iter().map(|m| m.classroom).collect(),
            Err(err) => {
                warn!(user = %session.user_id, error = %err, "Roster unavailable, presence not published");
                return;
            }
        };
        self.notifier
            .publish(Event::Presence(PresenceEvent {
                user_id: session.user_id.clone(),
                online,
                classrooms,
            }))
            .await;
    }
}
