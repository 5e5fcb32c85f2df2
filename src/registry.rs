//! Game registry (component C3): the table of games, the matchmaking queue,
//! and the lifecycle state machine. This is the single owner of shared game
//! state; every mutation happens inside one critical section so matchmaking
//! dequeue-and-bind is atomic.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::rules::{Board, Color};

pub type SessionId = u64;
pub type GameId = u32;
pub type UserId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Host has joined, waiting for a guest (either via matchmaking or a
    /// direct JOIN by game id).
    Unready,
    Ready,
    Completed,
}

#[derive(Debug, Clone)]
pub struct GameRecord {
    pub id: GameId,
    pub host_user_id: UserId,
    pub guest_user_id: Option<UserId>,
    pub board: Board,
    pub turn: u32,
    pub lifecycle: Lifecycle,
    /// `SessionId -> UserId` for every session currently bound to this game.
    /// Lets the registry find "the other session in this game" without the
    /// session manager needing a reverse index from game to sessions.
    pub bound_sessions: HashMap<SessionId, UserId>,
}

impl GameRecord {
    fn new(id: GameId, host_user_id: UserId) -> GameRecord {
        GameRecord {
            id,
            host_user_id,
            guest_user_id: None,
            board: Board::initial(),
            turn: 1,
            lifecycle: Lifecycle::Unready,
            bound_sessions: HashMap::new(),
        }
    }

    /// Host plays white, guest plays black.
    pub fn color_of(&self, user_id: UserId) -> Option<Color> {
        if user_id == self.host_user_id {
            Some(Color::White)
        } else if self.guest_user_id == Some(user_id) {
            Some(Color::Black)
        } else {
            None
        }
    }

    /// Every session bound to this game other than `session_id`.
    pub fn peers_of(&self, session_id: SessionId) -> Vec<SessionId> {
        self.bound_sessions
            .keys()
            .copied()
            .filter(|s| *s != session_id)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Became the host of a brand-new Unready game (matchmaking queue empty,
    /// or a private game via `requested_id == 1`).
    CreatedUnready,
    /// Matched with a queued host; the game is now Ready.
    MatchedAsGuest,
    /// Joined a specific existing Unready game by id as guest; now Ready.
    JoinedAsGuest,
    /// Rejoined a game the session's user already belongs to (host or
    /// guest), e.g. after a reconnect.
    Rejoined,
    GameNotFound,
    /// The game has already finished.
    GameCompleted,
    /// The game is Ready and full, and the caller is neither player.
    NotAPlayer,
}

#[derive(Debug, Clone)]
pub struct JoinResult {
    pub outcome: JoinOutcome,
    pub game: Option<GameRecord>,
    /// Sessions (other than the caller's) that must receive a CONNECT push
    /// because this join completed a pairing or reconnected a known player.
    pub notify_connect: Vec<SessionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Applied,
    /// Game isn't Ready yet/anymore, it isn't this color's turn, or the
    /// caller isn't a recognized player of this game.
    NotYourTurn,
    /// No legal capture from this square for the mover's color.
    NoCaptures,
    /// Session has no joined game at all.
    NoGame,
}

#[derive(Debug, Clone)]
pub struct MoveResult {
    pub outcome: MoveOutcome,
    pub game: Option<GameRecord>,
    /// The other session bound to this game, if any, which needs the
    /// post-move GAMESTATE push (and a WIN/LOSE/TIE push if the game just
    /// completed).
    pub notify_peer: Option<SessionId>,
}

struct Inner {
    next_game_id: GameId,
    games: HashMap<GameId, GameRecord>,
    /// FIFO queue of Unready game ids awaiting a matched guest, together with
    /// the host's user id (kept alongside the queue entry so self-pairing
    /// can be detected without a game table lookup per candidate).
    matchmaking_queue: VecDeque<(GameId, UserId)>,
}

/// Owns every game and the matchmaking queue behind a single mutex. All
/// mutating operations take the lock once and release it before returning;
/// the caller (the session manager) is responsible for turning the returned
/// notify lists into actual channel sends after the lock is dropped.
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            inner: Mutex::new(Inner {
                // 0 and 1 are reserved request-only sentinels; assigned ids
                // start at 2.
                next_game_id: 2,
                games: HashMap::new(),
                matchmaking_queue: VecDeque::new(),
            }),
        }
    }

    fn allocate(inner: &mut Inner) -> GameId {
        let id = inner.next_game_id;
        inner.next_game_id += 1;
        id
    }

    /// `session_id` is the caller's session, used to populate `bound_sessions`
    /// for the game it ends up joined to.
    pub fn join(&self, session_id: SessionId, user_id: UserId, game_id: GameId) -> JoinResult {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");

        match game_id {
            0 => Self::join_matchmaking(&mut inner, session_id, user_id),
            1 => Self::join_private(&mut inner, session_id, user_id),
            _ => Self::join_specific(&mut inner, session_id, user_id, game_id),
        }
    }

    fn join_matchmaking(inner: &mut Inner, session_id: SessionId, user_id: UserId) -> JoinResult {
        // Skip any queued head created by this same user id (self-pairing is
        // forbidden) but requeue it unchanged so fairness for other waiters
        // is preserved.
        let mut skipped = Vec::new();
        let mut matched: Option<GameId> = None;

        while let Some((candidate_id, host_user_id)) = inner.matchmaking_queue.pop_front() {
            if host_user_id == user_id {
                skipped.push((candidate_id, host_user_id));
                continue;
            }
            matched = Some(candidate_id);
            break;
        }
        for entry in skipped {
            inner.matchmaking_queue.push_back(entry);
        }

        if let Some(game_id) = matched {
            let game = inner.games.get_mut(&game_id).expect("queued game missing");
            game.guest_user_id = Some(user_id);
            game.lifecycle = Lifecycle::Ready;
            game.bound_sessions.insert(session_id, user_id);
            let notify_connect = game.peers_of(session_id);
            let game = game.clone();
            return JoinResult {
                outcome: JoinOutcome::MatchedAsGuest,
                game: Some(game),
                notify_connect,
            };
        }

        let game_id = Self::allocate(inner);
        let mut game = GameRecord::new(game_id, user_id);
        game.bound_sessions.insert(session_id, user_id);
        inner.matchmaking_queue.push_back((game_id, user_id));
        let game_clone = game.clone();
        inner.games.insert(game_id, game);

        JoinResult {
            outcome: JoinOutcome::CreatedUnready,
            game: Some(game_clone),
            notify_connect: Vec::new(),
        }
    }

    fn join_private(inner: &mut Inner, session_id: SessionId, user_id: UserId) -> JoinResult {
        let game_id = Self::allocate(inner);
        let mut game = GameRecord::new(game_id, user_id);
        game.bound_sessions.insert(session_id, user_id);
        let game_clone = game.clone();
        inner.games.insert(game_id, game);

        JoinResult {
            outcome: JoinOutcome::CreatedUnready,
            game: Some(game_clone),
            notify_connect: Vec::new(),
        }
    }

    fn join_specific(
        inner: &mut Inner,
        session_id: SessionId,
        user_id: UserId,
        game_id: GameId,
    ) -> JoinResult {
        let Some(game) = inner.games.get_mut(&game_id) else {
            return JoinResult {
                outcome: JoinOutcome::GameNotFound,
                game: None,
                notify_connect: Vec::new(),
            };
        };

        if game.lifecycle == Lifecycle::Completed {
            return JoinResult {
                outcome: JoinOutcome::GameCompleted,
                game: None,
                notify_connect: Vec::new(),
            };
        }

        if game.host_user_id == user_id || game.guest_user_id == Some(user_id) {
            game.bound_sessions.insert(session_id, user_id);
            let notify_connect = game.peers_of(session_id);
            let game = game.clone();
            return JoinResult {
                outcome: JoinOutcome::Rejoined,
                game: Some(game),
                notify_connect,
            };
        }

        if game.lifecycle == Lifecycle::Ready {
            // Ready and full, caller is neither host nor guest.
            return JoinResult {
                outcome: JoinOutcome::NotAPlayer,
                game: None,
                notify_connect: Vec::new(),
            };
        }

        // Unready, and the caller is a brand-new guest.
        game.guest_user_id = Some(user_id);
        game.lifecycle = Lifecycle::Ready;
        game.bound_sessions.insert(session_id, user_id);
        let notify_connect = game.peers_of(session_id);
        inner.matchmaking_queue.retain(|(id, _)| *id != game_id);
        let game = game.clone();

        JoinResult {
            outcome: JoinOutcome::JoinedAsGuest,
            game: Some(game),
            notify_connect,
        }
    }

    /// Applies a move on behalf of `user_id` via `session_id`'s joined game.
    /// Handles forced pass internally: if, after applying, the opponent has
    /// no legal move but the mover still does, the turn counter advances
    /// again so the same color moves next; if neither side can move the
    /// game becomes Completed.
    pub fn mv(&self, session_id: SessionId, game_id: GameId, user_id: UserId, x: u8, y: u8) -> MoveResult {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        let Some(game) = inner.games.get_mut(&game_id) else {
            return MoveResult {
                outcome: MoveOutcome::NoGame,
                game: None,
                notify_peer: None,
            };
        };

        let Some(color) = game.color_of(user_id) else {
            let game = game.clone();
            return MoveResult {
                outcome: MoveOutcome::NotYourTurn,
                game: Some(game),
                notify_peer: None,
            };
        };

        if game.lifecycle != Lifecycle::Ready || Color::from_turn(game.turn) != color {
            let game = game.clone();
            return MoveResult {
                outcome: MoveOutcome::NotYourTurn,
                game: Some(game),
                notify_peer: None,
            };
        }

        if game.board.captures(color, x, y).is_empty() {
            let game = game.clone();
            return MoveResult {
                outcome: MoveOutcome::NoCaptures,
                game: Some(game),
                notify_peer: None,
            };
        }

        game.board = game.board.apply(color, x, y);
        game.turn += 1;

        let opponent = color.opponent();
        if !game.board.has_any_legal(opponent) {
            if game.board.has_any_legal(color) {
                // Forced pass: opponent has no move, so the turn counter
                // advances again, landing back on the original mover's color.
                game.turn += 1;
            } else {
                game.lifecycle = Lifecycle::Completed;
            }
        }

        let notify_peer = game.peers_of(session_id).first().copied();
        let game = game.clone();

        MoveResult {
            outcome: MoveOutcome::Applied,
            game: Some(game),
            notify_peer,
        }
    }

    /// Removes `session_id` from whatever game it was bound to, returning the
    /// peer session (if any) that needs a DCONNECT push. The game record
    /// itself is left in place: the opponent may still be present, and a
    /// reconnect should be able to rejoin by game id.
    pub fn unbind(&self, session_id: SessionId, game_id: GameId) -> Option<SessionId> {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        let game = inner.games.get_mut(&game_id)?;
        game.bound_sessions.remove(&session_id);
        game.peers_of(session_id).first().copied()
    }

    #[cfg(test)]
    fn game(&self, game_id: GameId) -> Option<GameRecord> {
        self.inner
            .lock()
            .expect("registry mutex poisoned")
            .games
            .get(&game_id)
            .cloned()
    }
}

impl Default for Registry {
    fn default() -> Registry {
        Registry::new()
    }
}
