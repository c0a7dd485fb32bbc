//! An in-process stand-in for a Redis server, speaking just enough RESP for the cache.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use bytes::{Buf, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use super::wire::{parse_reply, Reply};

#[derive(Default)]
struct State {
    entries: Mutex<HashMap<String, (Vec<u8>, Option<Instant>)>>,
    commands: Mutex<Vec<Vec<String>>>,
    password: Option<String>,
    stalled: AtomicBool,
    connections: AtomicUsize,
}

pub(crate) struct FakeRedis {
    port: u16,
    state: Arc<State>,
}

impl FakeRedis {
    pub async fn start() -> Self {
        Self::start_with(None).await
    }

    pub async fn with_password(password: &str) -> Self {
        Self::start_with(Some(password.to_string())).await
    }

    async fn start_with(password: Option<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let state = Arc::new(State {
            password,
            ..Default::default()
        });

        tokio::spawn({
            let state = Arc::clone(&state);
            async move {
                while let Ok((socket, _)) = listener.accept().await {
                    state.connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(socket, Arc::clone(&state)));
                }
            }
        });

        Self { port, state }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> url::Url {
        url::Url::parse(&format!("redis://127.0.0.1:{}", self.port)).unwrap()
    }

    /// Stops answering commands, without closing the connections.
    pub fn stall(&self, stalled: bool) {
        self.state.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn insert(&self, key: &str, value: &str) {
        let mut entries = self.state.entries.lock().unwrap();
        entries.insert(key.to_string(), (value.as_bytes().to_vec(), None));
    }

    pub fn value(&self, key: &str) -> Option<String> {
        let entries = self.state.entries.lock().unwrap();

        entries
            .get(key)
            .map(|(value, _)| String::from_utf8(value.clone()).unwrap())
    }

    pub fn keys(&self) -> Vec<String> {
        let entries = self.state.entries.lock().unwrap();
        let mut keys = entries.keys().cloned().collect::<Vec<_>>();
        keys.sort();

        keys
    }

    /// Every command received so far, as text.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.state.commands.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }
}

async fn serve(mut socket: TcpStream, state: Arc<State>) {
    let mut buffer = BytesMut::with_capacity(1024);
    let mut authenticated = state.password.is_none();

    loop {
        let command = loop {
            match parse_reply(&buffer) {
                Ok(Some((reply, consumed))) => {
                    buffer.advance(consumed);
                    break reply;
                }
                Ok(None) => match socket.read_buf(&mut buffer).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => (),
                },
                Err(_) => return,
            }
        };

        let Reply::Array(Some(items)) = command else { return };

        let Some(args) = items
            .into_iter()
            .map(|item| match item {
                Reply::Bulk(Some(bytes)) => String::from_utf8(bytes).ok(),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
        else {
            return;
        };

        state.commands.lock().unwrap().push(args.clone());

        if state.stalled.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(30)).await;
            return;
        }

        let response = if !authenticated && args[0] != "AUTH" {
            b"-NOAUTH Authentication required.\r\n".to_vec()
        } else {
            execute(&state, &args, &mut authenticated)
        };

        if socket.write_all(&response).await.is_err() {
            return;
        }
    }
}

fn execute(state: &State, args: &[String], authenticated: &mut bool) -> Vec<u8> {
    let mut entries = state.entries.lock().unwrap();
    let now = Instant::now();

    entries.retain(|_, (_, expires_at)| !matches!(expires_at, Some(at) if *at <= now));

    match args[0].as_str() {
        "AUTH" => {
            let password = args.last().unwrap();

            if state.password.as_ref() == Some(password) {
                *authenticated = true;
                b"+OK\r\n".to_vec()
            } else {
                b"-WRONGPASS invalid username-password pair\r\n".to_vec()
            }
        }
        "SELECT" => b"+OK\r\n".to_vec(),
        "PING" => match args.get(1) {
            Some(message) => bulk(message.as_bytes()),
            None => b"+PONG\r\n".to_vec(),
        },
        "SET" => {
            let expires_at = match args.get(3).map(String::as_str) {
                Some("PX") => Some(now + Duration::from_millis(args[4].parse().unwrap())),
                _ => None,
            };

            entries.insert(args[1].clone(), (args[2].as_bytes().to_vec(), expires_at));
            b"+OK\r\n".to_vec()
        }
        "GET" => match entries.get(&args[1]) {
            Some((value, _)) => bulk(value),
            None => b"$-1\r\n".to_vec(),
        },
        "DEL" => {
            let deleted = args[1..].iter().filter(|key| entries.remove(*key).is_some()).count();
            format!(":{deleted}\r\n").into_bytes()
        }
        "SCAN" => {
            // A single page holding every match.
            let prefix = args[3].trim_end_matches('*').replace('\\', "");
            let keys = entries
                .keys()
                .filter(|key| key.starts_with(&prefix))
                .map(|key| bulk(key.as_bytes()))
                .collect::<Vec<_>>();

            let mut out = b"*2\r\n$1\r\n0\r\n".to_vec();
            out.extend_from_slice(format!("*{}\r\n", keys.len()).as_bytes());
            out.extend(keys.into_iter().flatten());
            out
        }
        "FLUSHALL" => {
            entries.clear();
            b"+OK\r\n".to_vec()
        }
        command => format!("-ERR unknown command '{command}'\r\n").into_bytes(),
    }
}

fn bulk(value: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", value.len()).into_bytes();
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
    out
}
