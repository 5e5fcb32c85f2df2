//! Session manager (component C4): one entry per accepted connection, binding
//! a user id and at most one joined game, and routing state pushes to the
//! right outbound channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::codec::{GameStateBody, StatePush, SERVER_MAX_VERSION, SERVER_MIN_VERSION};
use crate::registry::{GameId, GameRecord, JoinOutcome, Lifecycle, MoveOutcome, Registry, SessionId, UserId};
use crate::rules::Color;

struct SessionEntry {
    user_id: Option<UserId>,
    joined_game: Option<GameId>,
    tx: UnboundedSender<Vec<u8>>,
}

pub struct SessionManager {
    registry: Registry,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    next_session_id: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloOutcome {
    Accepted { version: u16 },
    /// HELLO sent twice on the same connection; carries the user id already
    /// bound so the client can see what it's talking to.
    AlreadyHello { user_id: UserId },
    /// The client's `max_version` is below what this server supports.
    UnsupportedVersion { min_version: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreSessionError {
    /// Any action other than HELLO attempted before HELLO on this connection.
    NotHelloed,
}

pub struct JoinReply {
    pub outcome: JoinOutcome,
    pub game_id: Option<GameId>,
    pub body: Option<GameStateBody>,
}

pub struct MoveReply {
    pub outcome: MoveOutcome,
    pub body: Option<GameStateBody>,
}

impl SessionManager {
    pub fn new() -> SessionManager {
        SessionManager {
            registry: Registry::new(),
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Registers a new session for a freshly accepted connection and returns
    /// its id plus the receiving half of its outbox channel.
    pub fn register(&self, tx: UnboundedSender<Vec<u8>>) -> SessionId {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.lock().expect("session mutex poisoned").insert(
            session_id,
            SessionEntry {
                user_id: None,
                joined_game: None,
                tx,
            },
        );
        session_id
    }

    /// Version negotiation: the server supports a single version. If the
    /// client's `max_version` is below our minimum, we reply UNSUPPORTED
    /// with our minimum; otherwise OK with `min(client.max_version,
    /// server_max_version)`.
    pub fn hello(&self, session_id: SessionId, max_version: u16, user_id: UserId) -> HelloOutcome {
        let mut sessions = self.sessions.lock().expect("session mutex poisoned");
        let entry = sessions
            .get_mut(&session_id)
            .expect("session must be registered before hello");

        if let Some(existing) = entry.user_id {
            return HelloOutcome::AlreadyHello { user_id: existing };
        }
        if max_version < SERVER_MIN_VERSION {
            return HelloOutcome::UnsupportedVersion {
                min_version: SERVER_MIN_VERSION,
            };
        }

        let version = max_version.min(SERVER_MAX_VERSION);
        entry.user_id = Some(user_id);
        info!(session_id, user_id, version, "session helloed");
        HelloOutcome::Accepted { version }
    }

    /// Every action but HELLO requires a prior successful HELLO on this
    /// connection; this is the "pre-session gate" referenced throughout the
    /// resolved-ambiguity notes.
    fn require_user(&self, session_id: SessionId) -> Result<UserId, PreSessionError> {
        let sessions = self.sessions.lock().expect("session mutex poisoned");
        sessions
            .get(&session_id)
            .and_then(|e| e.user_id)
            .ok_or(PreSessionError::NotHelloed)
    }

    pub fn join(&self, session_id: SessionId, game_id: GameId) -> Result<JoinReply, PreSessionError> {
        let user_id = self.require_user(session_id)?;
        let result = self.registry.join(session_id, user_id, game_id);

        if let Some(game) = &result.game {
            let mut sessions = self.sessions.lock().expect("session mutex poisoned");
            if let Some(entry) = sessions.get_mut(&session_id) {
                entry.joined_game = Some(game.id);
            }
            drop(sessions);

            if !result.notify_connect.is_empty() {
                self.push_to(&result.notify_connect, StatePush::Connect);
            }
        }

        let (game_id, body) = match (&result.game, result.outcome) {
            (
                Some(game),
                JoinOutcome::CreatedUnready
                | JoinOutcome::MatchedAsGuest
                | JoinOutcome::JoinedAsGuest
                | JoinOutcome::Rejoined,
            ) => (Some(game.id), Some(gamestate_for(game, user_id))),
            _ => (None, None),
        };

        Ok(JoinReply {
            outcome: result.outcome,
            game_id,
            body,
        })
    }

    pub fn mv(&self, session_id: SessionId, x: u8, y: u8) -> Result<MoveReply, PreSessionError> {
        let user_id = self.require_user(session_id)?;
        let joined_game = self
            .sessions
            .lock()
            .expect("session mutex poisoned")
            .get(&session_id)
            .and_then(|e| e.joined_game);

        let Some(game_id) = joined_game else {
            return Ok(MoveReply {
                outcome: MoveOutcome::NoGame,
                body: None,
            });
        };

        let result = self.registry.mv(session_id, game_id, user_id, x, y);

        if let Some(game) = &result.game {
            if result.outcome == MoveOutcome::Applied {
                if let Some(peer) = result.notify_peer {
                    if let Some(peer_user_id) = game.bound_sessions.get(&peer).copied() {
                        self.push_to(&[peer], StatePush::Gamestate(gamestate_for(game, peer_user_id)));
                    }
                }

                if game.lifecycle == Lifecycle::Completed {
                    info!(game_id, "game completed");
                    self.push_terminal_outcomes(game);
                }
            }
        }

        let body = result.game.as_ref().map(|g| gamestate_for(g, user_id));

        Ok(MoveReply {
            outcome: result.outcome,
            body,
        })
    }

    /// Sends WIN/LOSE/TIE to every session still bound to a just-completed
    /// game, immediately after their respective GAMESTATE.
    fn push_terminal_outcomes(&self, game: &GameRecord) {
        let (black, white) = game.board.score();
        for (&session_id, &user_id) in &game.bound_sessions {
            let Some(color) = game.color_of(user_id) else {
                continue;
            };
            let (stones, opponent_stones) = match color {
                Color::Black => (black, white),
                Color::White => (white, black),
            };
            let push = match stones.cmp(&opponent_stones) {
                std::cmp::Ordering::Greater => StatePush::Win,
                std::cmp::Ordering::Less => StatePush::Lose,
                std::cmp::Ordering::Equal => StatePush::Tie,
            };
            self.push_to(&[session_id], push);
        }
    }

    /// Sends an already-encoded frame straight to one session's outbox,
    /// bypassing the registry entirely. Used by the connection handler to
    /// deliver a request's own action-status reply through the same
    /// single-writer channel that carries pushes, so replies and pushes for
    /// one connection are never interleaved out of send order.
    pub fn send_direct(&self, session_id: SessionId, bytes: Vec<u8>) -> Result<(), ()> {
        let sessions = self.sessions.lock().expect("session mutex poisoned");
        match sessions.get(&session_id) {
            Some(entry) => entry.tx.send(bytes).map_err(|_| ()),
            None => Err(()),
        }
    }

    /// Tears the session down on connection close: unbinds it from any
    /// joined game and notifies the peer with a DCONNECT push.
    pub fn disconnect(&self, session_id: SessionId) {
        let joined_game = {
            let mut sessions = self.sessions.lock().expect("session mutex poisoned");
            match sessions.remove(&session_id) {
                Some(entry) => entry.joined_game,
                None => return,
            }
        };

        let Some(game_id) = joined_game else {
            return;
        };
        let Some(peer) = self.registry.unbind(session_id, game_id) else {
            return;
        };
        self.push_to(&[peer], StatePush::Dconnect);
        info!(session_id, game_id, "session disconnected");
    }

    fn push_to(&self, targets: &[SessionId], push: StatePush) {
        let bytes = push.encode();
        let sessions = self.sessions.lock().expect("session mutex poisoned");
        for target in targets {
            match sessions.get(target) {
                Some(entry) => {
                    // An error here means the peer's writer task already
                    // exited (connection closed concurrently); routine.
                    let _ = entry.tx.send(bytes.clone());
                }
                None => warn!(session_id = target, "push target has no session"),
            }
        }
    }
}

impl Default for SessionManager {
    fn default() -> SessionManager {
        SessionManager::new()
    }
}

/// Builds the GAMESTATE body as `user_id` should see it: their color in this
/// game, whether they currently have a legal move, and the shared board.
fn gamestate_for(game: &GameRecord, user_id: UserId) -> GameStateBody {
    let color = game.color_of(user_id).unwrap_or(Color::Black);
    GameStateBody {
        color,
        can_move: game.board.has_any_legal(color),
        turn: game.turn,
        cells: flatten(game),
    }
}

fn flatten(game: &GameRecord) -> [crate::rules::Cell; 64] {
    let mut cells = [crate::rules::Cell::Empty; 64];
    for y in 0..8u8 {
        for x in 0..8u8 {
            cells[y as usize * 8 + x as usize] = game.board.get(x, y);
        }
    }
    cells
}
