//! Connection handler (component C5): one task per accepted TCP connection,
//! plus a dedicated writer task that drains the session's outbox channel.
//! Splitting read and write into two tasks means a push generated by another
//! connection's action never has to wait behind this connection's current
//! read, and every outbound frame for a given connection is serialized
//! through the one channel, preserving per-connection ordering.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, info};

use crate::codec::{ActionStatusBody, ActionStatusFrame, ActionType, ClientFrame, Status};
use crate::registry::{JoinOutcome, MoveOutcome, SessionId};
use crate::session::{HelloOutcome, SessionManager};

pub async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, sessions: Arc<SessionManager>) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = unbounded_channel::<Vec<u8>>();
    let session_id = sessions.register(tx);

    info!(%peer_addr, session_id, "connection accepted");

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    loop {
        let mut action_byte = [0u8; 1];
        if reader.read_exact(&mut action_byte).await.is_err() {
            break; // peer closed or I/O error: tear the session down
        }

        let response = match ActionType::from_byte(action_byte[0]) {
            Some(action) => {
                let mut body = vec![0u8; action.body_len()];
                if reader.read_exact(&mut body).await.is_err() {
                    break; // truncated mid-body: treat like any other disconnect
                }
                let frame = ClientFrame::decode_body(action, &body)
                    .expect("read_exact supplied exactly body_len bytes");
                dispatch(&sessions, session_id, frame)
            }
            None => {
                debug!(session_id, preamble = action_byte[0], "unrecognized action preamble");
                ActionStatusFrame {
                    status: Status::Unsupported,
                    action_type: action_byte[0],
                    body: ActionStatusBody::None,
                }
            }
        };

        if sessions.send_direct(session_id, response.encode()).is_err() {
            break;
        }
    }

    sessions.disconnect(session_id);
    writer_task.abort();
    info!(%peer_addr, session_id, "connection closed");
}

fn dispatch(sessions: &SessionManager, session_id: SessionId, frame: ClientFrame) -> ActionStatusFrame {
    match frame {
        ClientFrame::Hello { max_version, user_id } => {
            let (status, body) = match sessions.hello(session_id, max_version, user_id) {
                HelloOutcome::Accepted { version } => (Status::Ok, ActionStatusBody::HelloOk { version }),
                HelloOutcome::AlreadyHello { user_id } => {
                    (Status::Invalid, ActionStatusBody::HelloInvalid { user_id })
                }
                HelloOutcome::UnsupportedVersion { min_version } => (
                    Status::Unsupported,
                    ActionStatusBody::HelloUnsupported { min_version },
                ),
            };
            ActionStatusFrame {
                status,
                action_type: ActionType::Hello.to_byte(),
                body,
            }
        }
        ClientFrame::Join { game_id } => match sessions.join(session_id, game_id) {
            Ok(reply) => {
                let status = match reply.outcome {
                    JoinOutcome::CreatedUnready
                    | JoinOutcome::MatchedAsGuest
                    | JoinOutcome::JoinedAsGuest
                    | JoinOutcome::Rejoined => Status::Ok,
                    JoinOutcome::GameNotFound | JoinOutcome::GameCompleted => Status::Invalid,
                    JoinOutcome::NotAPlayer => Status::Unauthorized,
                };
                let body = match (reply.game_id, reply.body) {
                    (Some(game_id), Some(state)) => ActionStatusBody::JoinOk { game_id, state },
                    _ => ActionStatusBody::None,
                };
                ActionStatusFrame {
                    status,
                    action_type: ActionType::Join.to_byte(),
                    body,
                }
            }
            // Pre-session gate: action before HELLO is INVALID with no body.
            Err(_) => ActionStatusFrame {
                status: Status::Invalid,
                action_type: ActionType::Join.to_byte(),
                body: ActionStatusBody::None,
            },
        },
        ClientFrame::Move { x, y } => match sessions.mv(session_id, x, y) {
            Ok(reply) => {
                // Resolved ambiguity: a session with no joined game gets the
                // bare action-status; a joined session always gets the
                // current GAMESTATE so the client can resync on any status.
                let (status, body) = match (reply.outcome, reply.body) {
                    (MoveOutcome::Applied, Some(state)) => (Status::Ok, ActionStatusBody::Move(state)),
                    (MoveOutcome::NotYourTurn, Some(state)) => {
                        (Status::Invalid, ActionStatusBody::Move(state))
                    }
                    (MoveOutcome::NoCaptures, Some(state)) => {
                        (Status::Illegal, ActionStatusBody::Move(state))
                    }
                    _ => (Status::Invalid, ActionStatusBody::None),
                };
                ActionStatusFrame {
                    status,
                    action_type: ActionType::Move.to_byte(),
                    body,
                }
            }
            Err(_) => ActionStatusFrame {
                status: Status::Invalid,
                action_type: ActionType::Move.to_byte(),
                body: ActionStatusBody::None,
            },
        },
    }
}
