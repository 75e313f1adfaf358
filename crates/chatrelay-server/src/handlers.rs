//! Request handlers, one per action.

use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use chatrelay_core::{Envelope, MessageKind, UserId};
use chatrelay_store::{NewMessage, Persistence, StoreError};

use crate::rpc::{self, Request, Response};
use crate::session::{ConnectionHandle, SessionRegistry};

/// Shared state available to all handlers.
pub struct HandlerState {
    pub store: Arc<dyn Persistence>,
    pub registry: Arc<SessionRegistry>,
}

impl HandlerState {
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self {
            store,
            registry: Arc::new(SessionRegistry::new()),
        }
    }

    pub fn with_registry(store: Arc<dyn Persistence>, registry: Arc<SessionRegistry>) -> Self {
        Self { store, registry }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Register,
    Login,
    ResumeSession,
    GetUsers,
    GetChatHistory,
    GetRecentChats,
    Message,
    SendImage,
    SendVoice,
    SendVideo,
    GetProfile,
    UpdateProfile,
    ChangePassword,
}

impl Action {
    pub const ALL: [Action; 13] = [
        Self::Register,
        Self::Login,
        Self::ResumeSession,
        Self::GetUsers,
        Self::GetChatHistory,
        Self::GetRecentChats,
        Self::Message,
        Self::SendImage,
        Self::SendVoice,
        Self::SendVideo,
        Self::GetProfile,
        Self::UpdateProfile,
        Self::ChangePassword,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Login => "login",
            Self::ResumeSession => "resume_session",
            Self::GetUsers => "get_users",
            Self::GetChatHistory => "get_chat_history",
            Self::GetRecentChats => "get_recent_chats",
            Self::Message => "message",
            Self::SendImage => "send_image",
            Self::SendVoice => "send_voice",
            Self::SendVideo => "send_video",
            Self::GetProfile => "get_profile",
            Self::UpdateProfile => "update_profile",
            Self::ChangePassword => "change_password",
        }
    }

    /// Whether the action needs a session bound to the connection.
    pub fn requires_session(self) -> bool {
        !matches!(self, Self::Register | Self::Login | Self::ResumeSession)
    }
}

impl FromStr for Action {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|a| a.as_str() == s).ok_or(())
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

type HandlerResult = Result<Response, Response>;

/// Run one request on behalf of `conn` and build its response.
///
/// Blocking: persistence calls run inline, so call this off the async
/// executor.
pub fn dispatch(state: &HandlerState, conn: &ConnectionHandle, request: &Request) -> Response {
    let Ok(action) = request.action.parse::<Action>() else {
        debug!(action = %request.action, "unknown action");
        return Response::invalid_action();
    };
    let fields = &request.fields;

    let result = if action.requires_session() {
        match state.registry.resolve_user(conn.id()) {
            Some(user_id) => authenticated(state, action, user_id, fields),
            None => {
                debug!(action = %action, "rejected unauthenticated request");
                Err(Response::unauthenticated())
            }
        }
    } else {
        match action {
            Action::Register => register(state, fields),
            Action::Login => login(state, conn, fields),
            _ => resume_session(state, conn, fields),
        }
    };
    result.unwrap_or_else(|resp| resp)
}

fn authenticated(
    state: &HandlerState,
    action: Action,
    user_id: UserId,
    fields: &Value,
) -> HandlerResult {
    match action {
        Action::GetUsers => get_users(state),
        Action::GetChatHistory => get_chat_history(state, user_id, fields),
        Action::GetRecentChats => get_recent_chats(state, user_id),
        Action::Message => send(state, user_id, fields, MessageKind::Text),
        Action::SendImage => send(state, user_id, fields, MessageKind::Image),
        Action::SendVoice => send(state, user_id, fields, MessageKind::Voice),
        Action::SendVideo => send(state, user_id, fields, MessageKind::Video),
        Action::GetProfile => get_profile(state, user_id),
        Action::UpdateProfile => update_profile(state, user_id, fields),
        Action::ChangePassword => change_password(state, user_id, fields),
        Action::Register | Action::Login | Action::ResumeSession => Err(Response::invalid_action()),
    }
}

fn store_error(e: StoreError) -> Response {
    if matches!(e, StoreError::Database(_) | StoreError::Io(_)) {
        warn!(error = %e, "persistence failure");
    }
    Response::error(e.to_string())
}

fn record_session(user_id: UserId) {
    tracing::Span::current().record("user_id", tracing::field::display(user_id));
}

// ── Session ──

fn register(state: &HandlerState, fields: &Value) -> HandlerResult {
    let display_name = rpc::require_str(fields, "display_name")?;
    let email = rpc::require_str(fields, "email")?;
    let password = rpc::require_str(fields, "password")?;

    let user_id = state
        .store
        .register(display_name, email, password)
        .map_err(store_error)?;
    Ok(Response::success_with_message("registration successful").with("user_id", user_id))
}

fn login(state: &HandlerState, conn: &ConnectionHandle, fields: &Value) -> HandlerResult {
    let email = rpc::require_str(fields, "email")?;
    let password = rpc::require_str(fields, "password")?;

    let profile = state.store.authenticate(email, password).map_err(store_error)?;
    let backlog = state.registry.establish(conn, profile.user_id);
    record_session(profile.user_id);
    info!(user_id = %profile.user_id, backlog, "user logged in");

    Ok(Response::success()
        .with("user_id", profile.user_id)
        .with("display_name", profile.display_name)
        .with("avatar", profile.avatar))
}

/// Rebind a known user id to this connection without credentials.
fn resume_session(state: &HandlerState, conn: &ConnectionHandle, fields: &Value) -> HandlerResult {
    let user_id = rpc::require_user_id(fields, "user_id")?;
    let backlog = state.registry.establish(conn, user_id);
    record_session(user_id);
    info!(user_id = %user_id, backlog, "session resumed");

    Ok(Response::success_with_message("session resumed").with("user_id", user_id))
}

// ── Directory and history ──

fn get_users(state: &HandlerState) -> HandlerResult {
    let users = state.store.list_users().map_err(store_error)?;
    Ok(Response::success().with("users", users))
}

fn get_chat_history(state: &HandlerState, user_id: UserId, fields: &Value) -> HandlerResult {
    let peer_id = rpc::require_user_id(fields, "receiver_id")?;
    let history = state.store.chat_history(user_id, peer_id).map_err(store_error)?;
    debug!(peer_id = %peer_id, entries = history.len(), "chat history loaded");
    Ok(Response::success().with("history", history))
}

fn get_recent_chats(state: &HandlerState, user_id: UserId) -> HandlerResult {
    let chats = state.store.recent_chats(user_id).map_err(store_error)?;
    Ok(Response::success().with("chats", chats))
}

// ── Messaging ──

fn sent_message(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Text => "message sent",
        MessageKind::Image => "image sent",
        MessageKind::Voice => "voice message sent",
        MessageKind::Video => "video sent",
    }
}

/// Persist a message, then hand it to the registry for live delivery or
/// the receiver's mailbox. Success means the message was stored and
/// routed, not that the receiver has seen it.
fn send(
    state: &HandlerState,
    sender_id: UserId,
    fields: &Value,
    kind: MessageKind,
) -> HandlerResult {
    let receiver_id = rpc::require_user_id(fields, "receiver_id")?;
    let (body, media) = match kind.data_field() {
        None => (rpc::require_str(fields, "message")?, None),
        Some(data_field) => {
            let data = rpc::require_str(fields, data_field)?;
            let filename = rpc::optional_str(fields, "filename")
                .or(kind.default_filename())
                .unwrap_or_default();
            (filename, Some(data))
        }
    };

    let stored = state
        .store
        .save_message(NewMessage {
            sender_id,
            receiver_id,
            kind,
            body,
            media,
        })
        .map_err(store_error)?;

    let (sender_name, sender_avatar) = match state.store.user_summary(sender_id) {
        Ok(summary) => (summary.display_name, summary.avatar),
        Err(_) => ("Unknown".to_string(), None),
    };

    let envelope = Envelope {
        sender_id,
        sender_name,
        sender_avatar,
        receiver_id,
        kind,
        payload: media.unwrap_or(body).to_string(),
        filename: kind.is_media().then(|| body.to_string()),
        timestamp: stored.timestamp,
    };
    let delivery = state.registry.route(envelope);
    debug!(receiver_id = %receiver_id, kind = %kind, delivery = ?delivery, "message routed");

    Ok(Response::success_with_message(sent_message(kind)))
}

// ── Profile ──

fn get_profile(state: &HandlerState, user_id: UserId) -> HandlerResult {
    let profile = state.store.profile(user_id).map_err(store_error)?;
    Ok(Response::success()
        .with("display_name", profile.display_name)
        .with("email", profile.email)
        .with("avatar", profile.avatar))
}

fn update_profile(state: &HandlerState, user_id: UserId, fields: &Value) -> HandlerResult {
    let display_name = rpc::optional_str(fields, "display_name");
    let avatar = rpc::optional_str(fields, "avatar");
    state
        .store
        .update_profile(user_id, display_name, avatar)
        .map_err(store_error)?;
    Ok(Response::success_with_message("profile updated"))
}

fn change_password(state: &HandlerState, user_id: UserId, fields: &Value) -> HandlerResult {
    let old_password = rpc::require_str(fields, "old_password")?;
    let new_password = rpc::require_str(fields, "new_password")?;
    state
        .store
        .change_password(user_id, old_password, new_password)
        .map_err(store_error)?;
    Ok(Response::success_with_message("password changed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use chatrelay_store::{
        Database, HistoryEntry, RecentChat, SqliteStore, StoredMessage, UserProfile, UserSummary,
    };
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Counts every call before delegating to an in-memory SQLite store.
    struct RecordingStore {
        inner: SqliteStore,
        calls: AtomicUsize,
    }

    impl RecordingStore {
        fn new() -> Self {
            Self {
                inner: SqliteStore::new(Database::in_memory().unwrap()),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn hit(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Persistence for RecordingStore {
        fn register(
            &self,
            display_name: &str,
            email: &str,
            password: &str,
        ) -> Result<UserId, StoreError> {
            self.hit();
            self.inner.register(display_name, email, password)
        }
        fn authenticate(&self, email: &str, password: &str) -> Result<UserProfile, StoreError> {
            self.hit();
            self.inner.authenticate(email, password)
        }
        fn user_summary(&self, user_id: UserId) -> Result<UserSummary, StoreError> {
            self.hit();
            self.inner.user_summary(user_id)
        }
        fn list_users(&self) -> Result<Vec<UserSummary>, StoreError> {
            self.hit();
            self.inner.list_users()
        }
        fn save_message(&self, message: NewMessage<'_>) -> Result<StoredMessage, StoreError> {
            self.hit();
            self.inner.save_message(message)
        }
        fn chat_history(
            &self,
            user_id: UserId,
            peer_id: UserId,
        ) -> Result<Vec<HistoryEntry>, StoreError> {
            self.hit();
            self.inner.chat_history(user_id, peer_id)
        }
        fn recent_chats(&self, user_id: UserId) -> Result<Vec<RecentChat>, StoreError> {
            self.hit();
            self.inner.recent_chats(user_id)
        }
        fn profile(&self, user_id: UserId) -> Result<UserProfile, StoreError> {
            self.hit();
            self.inner.profile(user_id)
        }
        fn update_profile(
            &self,
            user_id: UserId,
            display_name: Option<&str>,
            avatar: Option<&str>,
        ) -> Result<(), StoreError> {
            self.hit();
            self.inner.update_profile(user_id, display_name, avatar)
        }
        fn change_password(
            &self,
            user_id: UserId,
            old_password: &str,
            new_password: &str,
        ) -> Result<(), StoreError> {
            self.hit();
            self.inner.change_password(user_id, old_password, new_password)
        }
    }

    struct Harness {
        store: Arc<RecordingStore>,
        state: HandlerState,
    }

    fn setup() -> Harness {
        let store = Arc::new(RecordingStore::new());
        let state = HandlerState::new(store.clone());
        Harness { store, state }
    }

    fn request(value: serde_json::Value) -> Request {
        rpc::parse_request(&serde_json::to_vec(&value).unwrap()).unwrap()
    }

    impl Harness {
        fn call(&self, conn: &ConnectionHandle, value: serde_json::Value) -> Response {
            dispatch(&self.state, conn, &request(value))
        }

        fn register(&self, name: &str) -> UserId {
            let (conn, _rx) = ConnectionHandle::channel();
            let resp = self.call(
                &conn,
                json!({
                    "action": "register",
                    "display_name": name,
                    "email": format!("{name}@example.com"),
                    "password": "pw",
                }),
            );
            assert!(resp.is_success(), "{resp:?}");
            serde_json::from_value(resp.get("user_id").unwrap().clone()).unwrap()
        }

        fn logged_in(&self, name: &str) -> (ConnectionHandle, UnboundedReceiver<Bytes>) {
            let (conn, rx) = ConnectionHandle::channel();
            let resp = self.call(
                &conn,
                json!({
                    "action": "login",
                    "email": format!("{name}@example.com"),
                    "password": "pw",
                }),
            );
            assert!(resp.is_success(), "{resp:?}");
            (conn, rx)
        }
    }

    fn pushes(rx: &mut UnboundedReceiver<Bytes>) -> Vec<serde_json::Value> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|f| serde_json::from_slice(&f).unwrap())
            .collect()
    }

    #[test]
    fn action_names_round_trip() {
        for action in Action::ALL {
            assert_eq!(action.as_str().parse::<Action>(), Ok(action));
        }
        assert!("agent.message".parse::<Action>().is_err());
    }

    #[test]
    fn unknown_action_has_no_side_effects() {
        let h = setup();
        let (conn, _rx) = ConnectionHandle::channel();
        let resp = h.call(&conn, json!({"action": "delete_everything"}));
        assert_eq!(resp.message.as_deref(), Some("invalid action"));
        assert_eq!(h.store.calls(), 0);
    }

    #[test]
    fn unauthenticated_requests_never_reach_persistence() {
        let h = setup();
        let (conn, _rx) = ConnectionHandle::channel();
        let fields = json!({
            "receiver_id": 1, "message": "hi", "image_data": "AA==", "voice_data": "AA==",
            "video_data": "AA==", "display_name": "x", "old_password": "a", "new_password": "b"
        });

        for action in Action::ALL.into_iter().filter(|a| a.requires_session()) {
            let mut body = fields.clone();
            body["action"] = json!(action.as_str());
            let resp = h.call(&conn, body);
            assert!(!resp.is_success(), "{action} should be rejected");
            assert_eq!(resp.message.as_deref(), Some("unauthenticated"));
        }
        assert_eq!(h.store.calls(), 0);
    }

    #[test]
    fn register_reports_duplicates() {
        let h = setup();
        h.register("alice");
        let (conn, _rx) = ConnectionHandle::channel();
        let resp = h.call(
            &conn,
            json!({
                "action": "register",
                "display_name": "x",
                "email": "alice@example.com",
                "password": "pw",
            }),
        );
        assert!(!resp.is_success());
        assert_eq!(resp.message.as_deref(), Some("conflict: email already registered"));
    }

    #[test]
    fn register_missing_field() {
        let h = setup();
        let (conn, _rx) = ConnectionHandle::channel();
        let resp = h.call(&conn, json!({"action": "register", "email": "a@b.c", "password": "pw"}));
        assert_eq!(resp.message.as_deref(), Some("missing required field: display_name"));
        assert_eq!(h.store.calls(), 0);
    }

    #[test]
    fn login_binds_session_and_returns_profile() {
        let h = setup();
        let alice = h.register("alice");
        let (conn, _rx) = ConnectionHandle::channel();

        let resp = h.call(
            &conn,
            json!({
                "action": "login",
                "email": "alice@example.com",
                "password": "pw",
            }),
        );
        assert!(resp.is_success());
        assert_eq!(resp.get("user_id"), Some(&json!(alice.get())));
        assert_eq!(resp.get("display_name"), Some(&json!("alice")));
        assert_eq!(resp.get("avatar"), Some(&serde_json::Value::Null));
        assert_eq!(h.state.registry.resolve_user(conn.id()), Some(alice));
    }

    #[test]
    fn failed_login_does_not_bind() {
        let h = setup();
        h.register("alice");
        let (conn, _rx) = ConnectionHandle::channel();
        let resp = h.call(
            &conn,
            json!({
                "action": "login",
                "email": "alice@example.com",
                "password": "bad",
            }),
        );
        assert!(!resp.is_success());
        assert!(h.state.registry.resolve_user(conn.id()).is_none());
    }

    #[test]
    fn message_to_offline_user_is_delivered_on_resume() {
        let h = setup();
        let alice = h.register("alice");
        let bob = h.register("bob");
        let (a_conn, _a_rx) = h.logged_in("alice");

        let resp = h.call(
            &a_conn,
            json!({
                "action": "message",
                "receiver_id": bob.get(),
                "message": "hi",
            }),
        );
        assert!(resp.is_success());
        assert_eq!(resp.message.as_deref(), Some("message sent"));
        assert_eq!(h.state.registry.pending(bob), 1);

        let (b_conn, mut b_rx) = ConnectionHandle::channel();
        let resp = h.call(&b_conn, json!({"action": "resume_session", "user_id": bob.get()}));
        assert!(resp.is_success());
        assert_eq!(resp.message.as_deref(), Some("session resumed"));

        let frames = pushes(&mut b_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["action"], "message");
        assert_eq!(frames[0]["message"], "hi");
        assert_eq!(frames[0]["sender_id"], alice.get());
        assert_eq!(frames[0]["sender_name"], "alice");
        assert_eq!(h.state.registry.pending(bob), 0);
    }

    #[test]
    fn message_to_online_user_is_pushed_live() {
        let h = setup();
        h.register("alice");
        h.register("bob");
        let (a_conn, _a_rx) = h.logged_in("alice");
        let (b_conn, mut b_rx) = h.logged_in("bob");
        let bob = h.state.registry.resolve_user(b_conn.id()).unwrap();

        h.call(&a_conn, json!({"action": "message", "receiver_id": bob.get(), "message": "live"}));
        let frames = pushes(&mut b_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["message"], "live");
        assert_eq!(frames[0]["is_image"], false);
    }

    #[test]
    fn media_uses_default_filename() {
        let h = setup();
        h.register("alice");
        let bob = h.register("bob");
        let (a_conn, _a_rx) = h.logged_in("alice");

        let resp = h.call(
            &a_conn,
            json!({
                "action": "send_voice",
                "receiver_id": bob.get(),
                "voice_data": "UklGRg==",
            }),
        );
        assert_eq!(resp.message.as_deref(), Some("voice message sent"));

        let backlog = h.state.registry.drain(bob);
        assert_eq!(backlog[0].kind, MessageKind::Voice);
        assert_eq!(backlog[0].filename.as_deref(), Some("voice.wav"));
        assert_eq!(backlog[0].payload, "UklGRg==");
    }

    #[test]
    fn media_requires_payload_field() {
        let h = setup();
        h.register("alice");
        let bob = h.register("bob");
        let (a_conn, _a_rx) = h.logged_in("alice");

        let resp = h.call(
            &a_conn,
            json!({
                "action": "send_image",
                "receiver_id": bob.get(),
                "filename": "x.png",
            }),
        );
        assert_eq!(resp.message.as_deref(), Some("missing required field: image_data"));
        assert_eq!(h.state.registry.pending(bob), 0);
    }

    #[test]
    fn message_to_unknown_receiver_is_an_error() {
        let h = setup();
        h.register("alice");
        let (a_conn, _a_rx) = h.logged_in("alice");
        let resp = h.call(
            &a_conn,
            json!({
                "action": "message",
                "receiver_id": 999,
                "message": "hi",
            }),
        );
        assert!(!resp.is_success());
        assert_eq!(h.state.registry.pending(UserId::new(999)), 0);
    }

    #[test]
    fn resume_without_user_id() {
        let h = setup();
        let (conn, _rx) = ConnectionHandle::channel();
        let resp = h.call(&conn, json!({"action": "resume_session"}));
        assert_eq!(resp.message.as_deref(), Some("missing required field: user_id"));
    }

    #[test]
    fn history_and_recent_chats() {
        let h = setup();
        let alice = h.register("alice");
        let bob = h.register("bob");
        let (a_conn, _a_rx) = h.logged_in("alice");
        let (b_conn, _b_rx) = h.logged_in("bob");

        h.call(&a_conn, json!({"action": "message", "receiver_id": bob.get(), "message": "one"}));
        h.call(&b_conn, json!({"action": "message", "receiver_id": alice.get(), "message": "two"}));

        let resp = h.call(&a_conn, json!({"action": "get_chat_history", "receiver_id": bob.get()}));
        let history = resp.get("history").unwrap().as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["message"], "one");
        assert_eq!(history[1]["sender_name"], "bob");

        let resp = h.call(&a_conn, json!({"action": "get_recent_chats"}));
        let chats = resp.get("chats").unwrap().as_array().unwrap();
        assert_eq!(chats[0]["display_name"], "bob");
        assert_eq!(chats[0]["last_message"], "two");

        let resp = h.call(&a_conn, json!({"action": "get_users"}));
        assert_eq!(resp.get("users").unwrap().as_array().unwrap().len(), 2);
    }

    #[test]
    fn profile_update_and_password_change() {
        let h = setup();
        h.register("alice");
        let (conn, _rx) = h.logged_in("alice");

        let resp = h.call(
            &conn,
            json!({
                "action": "update_profile",
                "display_name": "Alice",
                "avatar": "QQ==",
            }),
        );
        assert_eq!(resp.message.as_deref(), Some("profile updated"));

        let resp = h.call(&conn, json!({"action": "get_profile"}));
        assert_eq!(resp.get("display_name"), Some(&json!("Alice")));
        assert_eq!(resp.get("email"), Some(&json!("alice@example.com")));
        assert_eq!(resp.get("avatar"), Some(&json!("QQ==")));

        let resp = h.call(&conn, json!({"action": "update_profile"}));
        assert!(!resp.is_success());

        let resp = h.call(
            &conn,
            json!({
                "action": "change_password",
                "old_password": "nope",
                "new_password": "new",
            }),
        );
        assert!(!resp.is_success());
        let resp = h.call(
            &conn,
            json!({
                "action": "change_password",
                "old_password": "pw",
                "new_password": "new",
            }),
        );
        assert_eq!(resp.message.as_deref(), Some("password changed"));
    }
}
