#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Not every test binary uses every helper"
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use global_relay_client::Session;
use global_relay_client::envelope::Envelope;
use global_relay_client::identity::{StaticTokenStore, Uuid};
use global_relay_client::ws::{ConnectionState, Credentials, Endpoint};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

pub const PLAYER_UID: &str = "player-1";
pub const SESSION_KEY: &str = "session-key";
pub const TOKEN: Uuid = Uuid::from_u128(0x0123_4567_89ab_cdef_0123_4567_89ab_cdef);

#[derive(Debug, Clone)]
enum Outgoing {
    Frame(Vec<u8>),
    Close(u16, &'static str),
}

/// Mock relay server.
pub struct MockRelay {
    addr: SocketAddr,
    /// Frames and close requests sent to ALL connected clients
    outgoing_tx: broadcast::Sender<Outgoing>,
    /// Envelopes received from clients, in arrival order
    received_rx: mpsc::UnboundedReceiver<Envelope>,
    /// Request URI of every accepted connection
    connections_rx: mpsc::UnboundedReceiver<String>,
}

impl MockRelay {
    /// Start a mock relay on a random port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (outgoing_tx, _) = broadcast::channel::<Outgoing>(100);
        let (received_tx, received_rx) = mpsc::unbounded_channel();
        let (connections_tx, connections_rx) = mpsc::unbounded_channel();

        let broadcast_tx = outgoing_tx.clone();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                // Subscribe before the handshake so nothing sent after the client sees
                // the connection open can be missed
                let mut outgoing_rx = broadcast_tx.subscribe();
                let uri_tx = connections_tx.clone();
                let record_uri =
                    move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                        drop(uri_tx.send(request.uri().to_string()));
                        Ok(response)
                    };

                let Ok(ws_stream) = tokio_tungstenite::accept_hdr_async(stream, record_uri).await
                else {
                    continue;
                };

                let (mut write, mut read) = ws_stream.split();
                let received_tx = received_tx.clone();

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Binary(data))) => {
                                        let envelope = Envelope::deserialize(&data).unwrap();
                                        drop(received_tx.send(envelope));
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                            msg = outgoing_rx.recv() => {
                                match msg {
                                    Ok(Outgoing::Frame(bytes)) => {
                                        if write.send(Message::Binary(bytes.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Ok(Outgoing::Close(code, reason)) => {
                                        let frame = CloseFrame {
                                            code: CloseCode::from(code),
                                            reason: reason.into(),
                                        };
                                        drop(write.send(Message::Close(Some(frame))).await);
                                        break;
                                    }
                                    Err(_) => break,
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            outgoing_tx,
            received_rx,
            connections_rx,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::custom(&format!("ws://{}", self.addr)).unwrap()
    }

    /// Send raw bytes to all connected clients.
    pub fn send(&self, bytes: Vec<u8>) {
        drop(self.outgoing_tx.send(Outgoing::Frame(bytes)));
    }

    /// Close every open connection with the given code and reason.
    pub fn close_all(&self, code: u16, reason: &'static str) {
        drop(self.outgoing_tx.send(Outgoing::Close(code, reason)));
    }

    /// Receive the next envelope written by a client.
    pub async fn recv(&mut self) -> Option<Envelope> {
        timeout(Duration::from_secs(2), self.received_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Envelope already received, without waiting.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.received_rx.try_recv().ok()
    }

    /// Request URI of the next accepted connection.
    pub async fn next_connection(&mut self) -> Option<String> {
        timeout(Duration::from_secs(2), self.connections_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Connection accepted already, without waiting.
    pub fn try_next_connection(&mut self) -> Option<String> {
        self.connections_rx.try_recv().ok()
    }
}

pub fn credentials() -> Credentials {
    Credentials::new(PLAYER_UID, SESSION_KEY.to_owned())
}

pub fn token_store() -> Arc<StaticTokenStore> {
    Arc::new(StaticTokenStore::new(TOKEN))
}

/// Wait until the session reaches a state matching `predicate`.
pub async fn wait_for_state<F>(session: &Session, predicate: F) -> ConnectionState
where
    F: FnMut(&ConnectionState) -> bool,
{
    let mut states = session.state_receiver();
    let state = timeout(Duration::from_secs(2), states.wait_for(predicate))
        .await
        .unwrap()
        .unwrap();
    *state
}
