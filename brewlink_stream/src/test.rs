//! Test fixtures shared by the unit tests in this crate

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use brewlink_tokens::{
    sources::{PasswordCredentials, TokenSource},
    stores::InMemoryTokenStore,
    AccessToken, AuthFailure, IdToken, RefreshToken, RefreshTokenRef, TokenBundle, TokenManager,
};
use tokio::{sync::mpsc, time::Instant};

use crate::{ClientMessage, ServerMessage, StreamConnection, StreamConnector, StreamError};

const HEADER: &str = "eyJhbGciOiJub25lIn0";
// {"exp":4102444800,"sub":"auth0|user-1"}
const CLAIMS: &str = "eyJleHAiOjQxMDI0NDQ4MDAsInN1YiI6ImF1dGgwfHVzZXItMSJ9";

/// The ID token issued on the `n`th exchange
pub(crate) fn id_token(n: usize) -> String {
    format!("{HEADER}.{CLAIMS}.id-{n}")
}

pub(crate) fn bundle(n: usize) -> TokenBundle {
    TokenBundle::from_tokens(
        AccessToken::new(format!("{HEADER}.{CLAIMS}.at-{n}")),
        IdToken::new(id_token(n)),
        RefreshToken::new(format!("rt-{n}")),
    )
    .expect("fixture tokens carry an expiry")
}

/// Issues bundle `n` on the `n`th refresh
#[derive(Debug, Default)]
pub(crate) struct SequentialSource {
    refreshes: AtomicUsize,
    malformed: AtomicUsize,
}

impl SequentialSource {
    /// Answers the next `n` refreshes with an undecodable response
    pub(crate) fn with_malformed_responses(self, n: usize) -> Self {
        self.malformed.store(n, Ordering::SeqCst);
        self
    }

    /// The number of bundles issued by refreshing
    pub(crate) fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenSource for SequentialSource {
    async fn login(&self, _: PasswordCredentials<'_>) -> Result<TokenBundle, AuthFailure> {
        Ok(bundle(0))
    }

    async fn refresh(&self, _: &RefreshTokenRef) -> Result<TokenBundle, AuthFailure> {
        let malformed = self
            .malformed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if malformed.is_ok() {
            return Err(AuthFailure::Protocol("undecodable token response".into()));
        }
        Ok(bundle(self.refreshes.fetch_add(1, Ordering::SeqCst) + 1))
    }
}

/// A manager holding bundle 0
pub(crate) fn tokens() -> (Arc<SequentialSource>, TokenManager) {
    let source = Arc::new(SequentialSource::default());
    let manager = TokenManager::new(Arc::clone(&source), InMemoryTokenStore::new())
        .with_initial_bundle(bundle(0));
    (source, manager)
}

/// What the next connection attempt does
#[derive(Debug)]
pub(crate) enum Script {
    /// Establish a connection
    Accept,
    /// Establish a connection that is already broken
    Drop,
    /// Fail the attempt
    Refuse(StreamError),
}

type Inbound = Result<ServerMessage, StreamError>;

#[derive(Debug)]
struct Peer {
    tx: Option<mpsc::UnboundedSender<Inbound>>,
    dropped: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

#[derive(Debug)]
struct Attempt {
    at: Instant,
    id_token: String,
}

/// A connector that follows a script and records everything sent
///
/// Once the script runs out every attempt is accepted.
#[derive(Debug, Default)]
pub(crate) struct MockConnector {
    script: Mutex<VecDeque<Script>>,
    attempts: Mutex<Vec<Attempt>>,
    peers: Mutex<Vec<Peer>>,
    sent: Arc<Mutex<Vec<(usize, ClientMessage)>>>,
}

impl MockConnector {
    pub(crate) fn then(self, script: Script) -> Self {
        self.script.lock().unwrap().push_back(script);
        self
    }

    /// The number of connection attempts made
    pub(crate) fn attempts(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub(crate) fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().iter().map(|a| a.at).collect()
    }

    /// The ID tokens presented, one per attempt
    pub(crate) fn presented(&self) -> Vec<String> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .map(|a| a.id_token.clone())
            .collect()
    }

    /// The number of connections established
    pub(crate) fn connections(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// Delivers a message on connection `n`
    pub(crate) fn deliver(&self, n: usize, message: Inbound) {
        let peers = self.peers.lock().unwrap();
        if let Some(tx) = &peers[n].tx {
            let _ = tx.send(message);
        }
    }

    /// Breaks connection `n`
    pub(crate) fn drop_peer(&self, n: usize) {
        let mut peers = self.peers.lock().unwrap();
        peers[n].dropped.store(true, Ordering::SeqCst);
        peers[n].tx = None;
    }

    /// Whether the supervisor closed connection `n`
    pub(crate) fn closed(&self, n: usize) -> bool {
        self.peers.lock().unwrap()[n].closed.load(Ordering::SeqCst)
    }

    /// The messages sent on connection `n`
    pub(crate) fn sent_to(&self, n: usize) -> Vec<ClientMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(i, _)| *i == n)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// The serial numbers registered on connection `n`, in order
    pub(crate) fn registrations(&self, n: usize) -> Vec<String> {
        self.sent_to(n)
            .into_iter()
            .filter_map(|m| match m {
                ClientMessage::AddAppliance { serial_number, .. } => {
                    Some(serial_number.as_str().to_owned())
                }
                ClientMessage::Ping => None,
            })
            .collect()
    }
}

#[async_trait]
impl StreamConnector for MockConnector {
    type Connection = MockConnection;

    async fn connect(&self, bundle: &TokenBundle) -> Result<MockConnection, StreamError> {
        self.attempts.lock().unwrap().push(Attempt {
            at: Instant::now(),
            id_token: bundle.id_token().as_str().to_owned(),
        });

        let script = self.script.lock().unwrap().pop_front();
        let broken = match script.unwrap_or(Script::Accept) {
            Script::Accept => false,
            Script::Drop => true,
            Script::Refuse(err) => return Err(err),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let dropped = Arc::new(AtomicBool::new(broken));
        let closed = Arc::new(AtomicBool::new(false));

        let mut peers = self.peers.lock().unwrap();
        let index = peers.len();
        peers.push(Peer {
            tx: (!broken).then_some(tx),
            dropped: Arc::clone(&dropped),
            closed: Arc::clone(&closed),
        });

        Ok(MockConnection {
            index,
            inbound: rx,
            dropped,
            closed,
            sent: Arc::clone(&self.sent),
        })
    }
}

#[derive(Debug)]
pub(crate) struct MockConnection {
    index: usize,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    dropped: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    sent: Arc<Mutex<Vec<(usize, ClientMessage)>>>,
}

#[async_trait]
impl StreamConnection for MockConnection {
    async fn send(&mut self, message: &ClientMessage) -> Result<(), StreamError> {
        if self.dropped.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }
        self.sent.lock().unwrap().push((self.index, message.clone()));
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<ServerMessage>, StreamError> {
        match self.inbound.recv().await {
            Some(message) => message.map(Some),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Waits, in virtual time, until `condition` holds
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..100_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition did not hold in time");
}
