use std::sync::Arc;

use axum::{
    Json,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use parley_store::models::NewMessage;
use parley_store::{Database, StoreError};
use parley_types::events::{ClientCommand, ServerEvent};
use parley_types::models::{MessageKind, Principal};

use crate::auth::AccessControl;
use crate::hub::{Departure, Hub, OutboundTx};

/// Shared dependencies for the websocket route.
#[derive(Clone)]
pub struct GatewayState {
    pub hub: Hub,
    pub store: Arc<Database>,
    pub access: Arc<dyn AccessControl>,
}

/// One connection's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Authorizing,
    Streaming,
    Closed,
}

/// Why a handshake was refused. The numeric reason codes are part of the
/// client protocol; the transport maps them to HTTP statuses because the
/// upgrade is rejected before a websocket ever exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    Unauthenticated,
    Unauthorized,
}

impl Refusal {
    pub fn close_code(self) -> u16 {
        match self {
            Refusal::Unauthenticated => 4001,
            Refusal::Unauthorized => 4003,
        }
    }

    fn message(self) -> &'static str {
        match self {
            Refusal::Unauthenticated => "authentication failed",
            Refusal::Unauthorized => "not a member of this group",
        }
    }
}

impl IntoResponse for Refusal {
    fn into_response(self) -> Response {
        let status = match self {
            Refusal::Unauthenticated => StatusCode::UNAUTHORIZED,
            Refusal::Unauthorized => StatusCode::FORBIDDEN,
        };
        let body = Json(serde_json::json!({
            "code": self.close_code(),
            "error": self.message(),
        }));
        (status, body).into_response()
    }
}

/// Explicit state machine for one connection, independent of the websocket
/// so the handshake can be driven by tests with no I/O at all. A refused
/// session is never registered with the hub.
pub struct Session {
    state: SessionState,
    group_id: i64,
    principal: Option<Principal>,
}

impl Session {
    pub fn new(group_id: i64) -> Self {
        Self {
            state: SessionState::Connecting,
            group_id,
            principal: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn group_id(&self) -> i64 {
        self.group_id
    }

    /// Connecting -> Authenticating. Resolves the caller's token; failure
    /// closes the session with reason code 4001.
    pub fn authenticate(
        &mut self,
        access: &dyn AccessControl,
        token: Option<&str>,
    ) -> Result<Principal, Refusal> {
        self.state = SessionState::Authenticating;
        match token.and_then(|t| access.principal_for_token(t)) {
            Some(principal) => {
                self.principal = Some(principal.clone());
                self.state = SessionState::Authorizing;
                Ok(principal)
            }
            None => {
                self.state = SessionState::Closed;
                Err(Refusal::Unauthenticated)
            }
        }
    }

    /// Authorizing: a valid identity that is not a group member is refused
    /// with reason code 4003.
    pub fn authorize(&mut self, access: &dyn AccessControl) -> Result<(), Refusal> {
        let member = self
            .principal
            .as_ref()
            .is_some_and(|p| access.is_member(self.group_id, p.id));
        if member {
            Ok(())
        } else {
            self.state = SessionState::Closed;
            Err(Refusal::Unauthorized)
        }
    }

    fn begin_streaming(&mut self) {
        self.state = SessionState::Streaming;
    }

    fn close(&mut self) {
        self.state = SessionState::Closed;
    }
}

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    /// Bearer token; this transport cannot carry custom headers, so the
    /// token rides in the query string.
    token: Option<String>,
}

/// Handshake at the framework boundary: the upgrade is only granted after
/// authentication and authorization succeed, so an unauthenticated or
/// unauthorized peer never sees a successful upgrade.
pub async fn ws_connect(
    State(gateway): State<GatewayState>,
    Path(group_id): Path<i64>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let mut session = Session::new(group_id);
    let principal = match session.authenticate(gateway.access.as_ref(), params.token.as_deref()) {
        Ok(principal) => principal,
        Err(refusal) => return refusal.into_response(),
    };
    if let Err(refusal) = session.authorize(gateway.access.as_ref()) {
        return refusal.into_response();
    }
    ws.on_upgrade(move |socket| stream(socket, gateway, session, principal))
}

/// Authorizing -> Streaming -> Closed: register with the hub, pump frames
/// both ways, then tear down and announce the departure.
async fn stream(socket: WebSocket, gateway: GatewayState, mut session: Session, principal: Principal) {
    let group_id = session.group_id();
    let user_id = principal.id;
    let (mut sink, mut source) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let conn_id = gateway.hub.connect(group_id, user_id, tx.clone()).await;
    session.begin_streaming();
    info!("{} ({}) joined group {}", principal.username, user_id, group_id);

    // Forward task: everything the hub queues for this connection goes out
    // through the sink; a failed write ends the session.
    let mut send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let recv_gateway = gateway.clone();
    let recv_principal = principal.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(frame)) = source.next().await {
            match frame {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(command) => {
                        handle_command(&recv_gateway, group_id, &recv_principal, command, &tx).await
                    }
                    // Unrecognized envelope kinds are not fatal.
                    Err(e) => debug!("ignoring unrecognized envelope from {}: {}", recv_principal.id, e),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    session.close();
    let departure = gateway.hub.disconnect(group_id, user_id, conn_id).await;
    // A superseded connection stays quiet: its replacement is still online
    // and a departure announcement would contradict it.
    if departure != Departure::Superseded {
        let left = ServerEvent::UserLeft {
            user_id,
            timestamp: Utc::now(),
        };
        gateway.hub.broadcast(group_id, &left, None).await;
    }
    info!("{} ({}) left group {}", principal.username, user_id, group_id);
}

/// Streaming-state envelope dispatch. Persistence is authoritative and
/// happens before any fan-out; a store failure is non-fatal to the
/// connection and goes back to the offending client only.
pub async fn handle_command(
    gateway: &GatewayState,
    group_id: i64,
    principal: &Principal,
    command: ClientCommand,
    reply: &OutboundTx,
) {
    match command {
        ClientCommand::Message {
            content,
            message_type,
            code_language,
            reply_to_id,
        } => {
            let content = content.trim().to_string();
            if content.is_empty() {
                send_error(reply, "message body must not be empty");
                return;
            }
            if !matches!(message_type, MessageKind::Text | MessageKind::Code) {
                send_error(reply, "only text and code messages can be sent here");
                return;
            }

            let draft = NewMessage {
                group_id,
                sender_id: principal.id,
                kind: message_type,
                body: Some(content),
                code_language,
                file: None,
                reply_to: reply_to_id,
            };
            let store = gateway.store.clone();
            let appended = tokio::task::spawn_blocking(move || store.append(draft)).await;
            match appended {
                Ok(Ok(row)) => {
                    let event = ServerEvent::NewMessage {
                        message: row.into_view(),
                        timestamp: Utc::now(),
                    };
                    // The sender is not excluded: its own client renders
                    // the canonical echo instead of an optimistic copy.
                    gateway.hub.broadcast(group_id, &event, None).await;
                }
                Ok(Err(StoreError::Validation(reason))) => send_error(reply, &reason),
                Ok(Err(e)) => {
                    error!("failed to store message from {}: {}", principal.id, e);
                    send_error(reply, "message could not be stored");
                }
                Err(e) => {
                    error!("spawn_blocking join error: {}", e);
                    send_error(reply, "message could not be stored");
                }
            }
        }

        ClientCommand::Typing { is_typing } => {
            gateway.hub.set_typing(group_id, principal.id, is_typing).await;
        }
    }
}

fn send_error(reply: &OutboundTx, message: &str) {
    let event = ServerEvent::Error {
        message: message.to_string(),
    };
    let _ = reply.send(serde_json::to_string(&event).expect("server envelopes always serialize"));
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeAccess {
        members: Vec<(i64, i64)>,
    }

    impl AccessControl for FakeAccess {
        fn principal_for_token(&self, token: &str) -> Option<Principal> {
            let id: i64 = token.strip_prefix("user-")?.parse().ok()?;
            Some(Principal {
                id,
                username: format!("user{id}"),
            })
        }

        fn is_member(&self, group_id: i64, user_id: i64) -> bool {
            self.members.contains(&(group_id, user_id))
        }
    }

    #[test]
    fn handshake_refuses_bad_tokens_before_registration() {
        let access = FakeAccess { members: vec![] };
        let mut session = Session::new(42);
        assert_eq!(session.state(), SessionState::Connecting);

        let refusal = session.authenticate(&access, Some("garbage")).unwrap_err();
        assert_eq!(refusal, Refusal::Unauthenticated);
        assert_eq!(refusal.close_code(), 4001);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn handshake_refuses_missing_tokens() {
        let access = FakeAccess { members: vec![] };
        let mut session = Session::new(42);
        let refusal = session.authenticate(&access, None).unwrap_err();
        assert_eq!(refusal.close_code(), 4001);
    }

    #[test]
    fn handshake_refuses_non_members() {
        let access = FakeAccess { members: vec![] };
        let mut session = Session::new(42);
        session.authenticate(&access, Some("user-1")).unwrap();
        assert_eq!(session.state(), SessionState::Authorizing);

        let refusal = session.authorize(&access).unwrap_err();
        assert_eq!(refusal, Refusal::Unauthorized);
        assert_eq!(refusal.close_code(), 4003);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn handshake_admits_members() {
        let access = FakeAccess {
            members: vec![(42, 1)],
        };
        let mut session = Session::new(42);
        let principal = session.authenticate(&access, Some("user-1")).unwrap();
        assert_eq!(principal.id, 1);
        session.authorize(&access).unwrap();
        assert_eq!(session.state(), SessionState::Authorizing);
    }

    fn seeded_gateway() -> (GatewayState, i64, i64, i64) {
        let store = Arc::new(Database::open_in_memory().unwrap());
        let alice = store.create_user("alice", "alice@example.com", "x").unwrap();
        let bob = store.create_user("bob", "bob@example.com", "x").unwrap();
        let group = store.create_group("general", alice, false).unwrap();
        store.add_member(group, alice, true).unwrap();
        store.add_member(group, bob, false).unwrap();

        let access: Arc<dyn AccessControl> = Arc::new(FakeAccess {
            members: vec![(group, alice), (group, bob)],
        });
        let gateway = GatewayState {
            hub: Hub::new(),
            store,
            access,
        };
        (gateway, group, alice, bob)
    }

    fn recv_event(rx: &mut mpsc::UnboundedReceiver<String>) -> ServerEvent {
        serde_json::from_str(&rx.try_recv().expect("expected a queued envelope")).unwrap()
    }

    #[tokio::test]
    async fn sent_messages_are_stored_then_echoed_to_everyone() {
        let (gateway, group, alice_id, bob_id) = seeded_gateway();
        let (tx_alice, mut rx_alice) = mpsc::unbounded_channel();
        let (tx_bob, mut rx_bob) = mpsc::unbounded_channel();
        gateway.hub.connect(group, alice_id, tx_alice.clone()).await;
        gateway.hub.connect(group, bob_id, tx_bob).await;
        while rx_alice.try_recv().is_ok() {} // join noise

        let alice = Principal {
            id: alice_id,
            username: "alice".into(),
        };
        let command: ClientCommand = serde_json::from_str(
            r#"{"type":"message","content":"hello","message_type":"text"}"#,
        )
        .unwrap();
        handle_command(&gateway, group, &alice, command, &tx_alice).await;

        // the sender receives its own canonical echo
        match recv_event(&mut rx_alice) {
            ServerEvent::NewMessage { message, .. } => {
                assert_eq!(message.content.as_deref(), Some("hello"));
                assert_eq!(message.sender_id, alice_id);
                assert_eq!(message.sender_username, "alice");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        // so does the peer
        assert!(matches!(
            recv_event(&mut rx_bob),
            ServerEvent::NewMessage { .. }
        ));

        // and the durable page holds exactly that message
        let page = gateway.store.page(group, None, 50).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].body.as_deref(), Some("hello"));
        assert_eq!(page[0].sender_id, alice_id);
        assert_eq!(page[0].group_id, group);
    }

    #[tokio::test]
    async fn empty_messages_bounce_back_to_the_sender_only() {
        let (gateway, group, alice_id, bob_id) = seeded_gateway();
        let (tx_alice, mut rx_alice) = mpsc::unbounded_channel();
        let (tx_bob, mut rx_bob) = mpsc::unbounded_channel();
        gateway.hub.connect(group, alice_id, tx_alice.clone()).await;
        gateway.hub.connect(group, bob_id, tx_bob).await;
        while rx_alice.try_recv().is_ok() {}

        let alice = Principal {
            id: alice_id,
            username: "alice".into(),
        };
        let command = ClientCommand::Message {
            content: "   ".into(),
            message_type: MessageKind::Text,
            code_language: None,
            reply_to_id: None,
        };
        handle_command(&gateway, group, &alice, command, &tx_alice).await;

        assert!(matches!(recv_event(&mut rx_alice), ServerEvent::Error { .. }));
        assert!(rx_bob.try_recv().is_err());
        assert!(gateway.store.page(group, None, 50).unwrap().is_empty());
    }

    #[tokio::test]
    async fn reply_validation_failures_reach_only_the_sender() {
        let (gateway, group, alice_id, _) = seeded_gateway();
        let (tx_alice, mut rx_alice) = mpsc::unbounded_channel();
        gateway.hub.connect(group, alice_id, tx_alice.clone()).await;

        let alice = Principal {
            id: alice_id,
            username: "alice".into(),
        };
        let command = ClientCommand::Message {
            content: "replying to nothing".into(),
            message_type: MessageKind::Text,
            code_language: None,
            reply_to_id: Some(4242),
        };
        handle_command(&gateway, group, &alice, command, &tx_alice).await;

        assert!(matches!(recv_event(&mut rx_alice), ServerEvent::Error { .. }));
        assert!(gateway.store.page(group, None, 50).unwrap().is_empty());
    }

    #[tokio::test]
    async fn typing_commands_flow_through_the_hub() {
        let (gateway, group, alice_id, _) = seeded_gateway();
        let (tx_alice, mut rx_alice) = mpsc::unbounded_channel();
        gateway.hub.connect(group, alice_id, tx_alice.clone()).await;

        let alice = Principal {
            id: alice_id,
            username: "alice".into(),
        };
        handle_command(
            &gateway,
            group,
            &alice,
            ClientCommand::Typing { is_typing: true },
            &tx_alice,
        )
        .await;

        match recv_event(&mut rx_alice) {
            ServerEvent::TypingUpdate { typing_users, .. } => {
                assert_eq!(typing_users, vec![alice_id])
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(gateway.hub.typing_users(group).await, vec![alice_id]);
    }
}
