//! End-to-end protocol test: binds the real server on an ephemeral loopback
//! port and drives it with raw `TcpStream`s speaking the wire format exactly
//! as two independent clients would.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use othello_server::config::Config;

async fn spawn_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = Config {
        bind_addr: addr.to_string(),
    };
    tokio::spawn(async move {
        othello_server::run(config).await.unwrap();
    });

    // Give the listener a moment to actually bind before clients connect.
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

fn hello(max_version: u16, user_id: u32) -> [u8; 7] {
    let v = max_version.to_be_bytes();
    let u = user_id.to_be_bytes();
    [0, v[0], v[1], u[0], u[1], u[2], u[3]]
}

fn join(game_id: u32) -> [u8; 5] {
    let p = game_id.to_be_bytes();
    [1, p[0], p[1], p[2], p[3]]
}

fn mv(x: u8, y: u8) -> [u8; 2] {
    [2, (x << 4) | (y & 0x0F)]
}

async fn read_exact_frame(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

#[tokio::test]
async fn handshake_matchmaking_and_move_flow() {
    let addr = spawn_server().await;

    let mut host = TcpStream::connect(addr).await.unwrap();
    let mut guest = TcpStream::connect(addr).await.unwrap();

    host.write_all(&hello(0, 100)).await.unwrap();
    let host_hello = read_exact_frame(&mut host, 4).await;
    assert_eq!(host_hello, vec![0x00, 0x00, 0x00, 0x00]); // status OK, action Hello, version 0

    guest.write_all(&hello(0, 200)).await.unwrap();
    let guest_hello = read_exact_frame(&mut guest, 4).await;
    assert_eq!(guest_hello, vec![0x00, 0x00, 0x00, 0x00]);

    host.write_all(&join(0)).await.unwrap();
    let host_join_preamble = read_exact_frame(&mut host, 2).await;
    assert_eq!(host_join_preamble, vec![0x00, 0x01]); // Ok, Join
    let host_join_body = read_exact_frame(&mut host, 4 + 17).await; // game_id + GAMESTATE
    let host_game_id = u32::from_be_bytes(host_join_body[0..4].try_into().unwrap());
    assert_eq!(host_game_id, 2); // first assigned id, per the reserved 0/1 sentinels
    let host_color_byte = host_join_body[4];
    assert_eq!(host_color_byte & 0x80, 0x80); // host is white (color bit 1)

    guest.write_all(&join(0)).await.unwrap();
    let guest_join_preamble = read_exact_frame(&mut guest, 2).await;
    assert_eq!(guest_join_preamble, vec![0x00, 0x01]);
    let guest_join_body = read_exact_frame(&mut guest, 4 + 17).await;
    assert_eq!(
        u32::from_be_bytes(guest_join_body[0..4].try_into().unwrap()),
        host_game_id
    );
    let guest_color_byte = guest_join_body[4];
    assert_eq!(guest_color_byte & 0x80, 0); // guest is black (color bit 0)
    let turn = guest_color_byte & 0x3F;
    assert_eq!(turn, 1);

    // Host receives an unsolicited, empty-bodied CONNECT push.
    let connect = read_exact_frame(&mut host, 2).await;
    assert_eq!(connect[0] & 0x80, 0x80);
    assert_eq!(connect[0] & 0x7F, 0); // CONNECT message type

    // Black (guest) makes the opening capture at d3 (x=3, y=2).
    guest.write_all(&mv(3, 2)).await.unwrap();
    let move_preamble = read_exact_frame(&mut guest, 2).await;
    assert_eq!(move_preamble, vec![0x00, 0x02]); // Ok, Move
    let move_body = read_exact_frame(&mut guest, 17).await;
    let new_turn = move_body[0] & 0x3F;
    assert_eq!(new_turn, 2);

    // Host receives the resulting GAMESTATE push, tailored to its own color.
    let push_preamble = read_exact_frame(&mut host, 2).await;
    assert_eq!(push_preamble[0] & 0x80, 0x80);
    assert_eq!(push_preamble[1], 0x02); // Gamestate message type
    let push_body = read_exact_frame(&mut host, 17).await;
    assert_eq!(push_body[0] & 0x80, 0x80); // host sees itself as white
    assert_eq!(push_body[0] & 0x3F, 2);
}

#[tokio::test]
async fn illegal_move_is_rejected_without_advancing_turn() {
    let addr = spawn_server().await;

    let mut host = TcpStream::connect(addr).await.unwrap();
    let mut guest = TcpStream::connect(addr).await.unwrap();

    host.write_all(&hello(0, 1)).await.unwrap();
    let _ = read_exact_frame(&mut host, 4).await;
    guest.write_all(&hello(0, 2)).await.unwrap();
    let _ = read_exact_frame(&mut guest, 4).await;

    host.write_all(&join(0)).await.unwrap();
    let _ = read_exact_frame(&mut host, 2).await;
    let _ = read_exact_frame(&mut host, 4 + 17).await;
    guest.write_all(&join(0)).await.unwrap();
    let _ = read_exact_frame(&mut guest, 2).await;
    let _ = read_exact_frame(&mut guest, 4 + 17).await;
    let _ = read_exact_frame(&mut host, 2).await; // CONNECT preamble (empty body)

    // Occupied square: no captures possible, ILLEGAL.
    guest.write_all(&mv(3, 3)).await.unwrap();
    let preamble = read_exact_frame(&mut guest, 2).await;
    assert_eq!(preamble[0], 0x02); // status Illegal
    let body = read_exact_frame(&mut guest, 17).await;
    assert_eq!(body[0] & 0x3F, 1); // turn unchanged
}

#[tokio::test]
async fn disconnect_delivers_dconnect_to_peer() {
    let addr = spawn_server().await;

    let mut host = TcpStream::connect(addr).await.unwrap();
    let mut guest = TcpStream::connect(addr).await.unwrap();

    host.write_all(&hello(0, 1)).await.unwrap();
    let _ = read_exact_frame(&mut host, 4).await;
    guest.write_all(&hello(0, 2)).await.unwrap();
    let _ = read_exact_frame(&mut guest, 4).await;

    host.write_all(&join(0)).await.unwrap();
    let _ = read_exact_frame(&mut host, 2).await;
    let _ = read_exact_frame(&mut host, 4 + 17).await;
    guest.write_all(&join(0)).await.unwrap();
    let _ = read_exact_frame(&mut guest, 2).await;
    let _ = read_exact_frame(&mut guest, 4 + 17).await;
    let _ = read_exact_frame(&mut host, 2).await; // CONNECT

    drop(host);

    let dconnect = read_exact_frame(&mut guest, 2).await;
    assert_eq!(dconnect[0] & 0x80, 0x80);
    assert_eq!(dconnect[0] & 0x7F, 1); // Dconnect message type
    assert_eq!(dconnect[1], 0); // high byte of the 15-bit message type
}

#[tokio::test]
async fn unrecognized_action_preamble_gets_unsupported_reply() {
    let addr = spawn_server().await;
    let mut conn = TcpStream::connect(addr).await.unwrap();

    conn.write_all(&hello(0, 1)).await.unwrap();
    let _ = read_exact_frame(&mut conn, 4).await;

    conn.write_all(&[0x7F]).await.unwrap(); // not a known action preamble
    let reply = read_exact_frame(&mut conn, 2).await;
    assert_eq!(reply[0], 0x04); // status Unsupported
    assert_eq!(reply[1], 0x7F); // echoes the raw preamble byte

    // The connection stays open and keeps serving further requests.
    conn.write_all(&join(1)).await.unwrap();
    let preamble = read_exact_frame(&mut conn, 2).await;
    assert_eq!(preamble, vec![0x00, 0x01]);
}
