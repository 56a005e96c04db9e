//! Session and stream bookkeeping for the streamable HTTP server transport.
//!
//! A *session* groups the streams opened by one client after its
//! `initialize` handshake. A *stream* is one open SSE response body: it
//! numbers its events, keeps the last [`EventStream::LOG_CAPACITY`] of them
//! for replay, and remembers which request ids still owe it a response.
//!
//! Everything here is plain data guarded by the transport's session lock.
//! Writes go through unbounded channels, so nothing in this module awaits.
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::model::{JsonRpcMessage, RequestId};

pub type SessionId = Arc<str>;

pub fn session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string().into()
}

pub type StreamId = u64;

/// Render one SSE frame.
pub fn sse_frame(event_id: u64, data: &str) -> Bytes {
    Bytes::from(format!("id: {event_id}\ndata: {data}\n\n"))
}

pub const KEEP_ALIVE_FRAME: &[u8] = b":ping\n\n";

#[derive(Debug)]
pub struct EventStream {
    id: StreamId,
    tx: UnboundedSender<Bytes>,
    event_counter: u64,
    log: VecDeque<(u64, Arc<str>)>,
    pending: HashSet<RequestId>,
}

impl EventStream {
    pub const LOG_CAPACITY: usize = 100;

    pub fn new(id: StreamId) -> (Self, UnboundedReceiver<Bytes>) {
        let (tx, rx) = unbounded_channel();
        (
            Self {
                id,
                tx,
                event_counter: 0,
                log: VecDeque::with_capacity(Self::LOG_CAPACITY),
                pending: HashSet::new(),
            },
            rx,
        )
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn sender(&self) -> &UnboundedSender<Bytes> {
        &self.tx
    }

    pub fn track_request(&mut self, id: RequestId) {
        self.pending.insert(id);
    }

    /// Whether the response body reading this stream has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn is_waiting_for(&self, id: &RequestId) -> bool {
        self.pending.contains(id)
    }

    /// Drop `id` from the pending set. Returns `true` once nothing is left.
    pub fn settle(&mut self, id: &RequestId) -> bool {
        self.pending.remove(id);
        self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Serialize and emit `message` as the next event on this stream.
    pub fn push(&mut self, message: &JsonRpcMessage) -> Result<u64, serde_json::Error> {
        let data: Arc<str> = serde_json::to_string(message)?.into();
        Ok(self.push_raw(data))
    }

    fn push_raw(&mut self, data: Arc<str>) -> u64 {
        self.event_counter += 1;
        let event_id = self.event_counter;
        if self.tx.send(sse_frame(event_id, &data)).is_err() {
            tracing::warn!(stream = self.id, event_id, "sse receiver dropped, event kept for replay");
        }
        if self.log.len() == Self::LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back((event_id, data));
        event_id
    }

    /// Logged events with an id strictly greater than `last_event_id`.
    pub fn events_after(&self, last_event_id: u64) -> Vec<Arc<str>> {
        self.log
            .iter()
            .filter(|(id, _)| *id > last_event_id)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Re-emit already serialized events, numbering them on this stream.
    pub fn replay(&mut self, events: Vec<Arc<str>>) -> usize {
        let count = events.len();
        for data in events {
            self.push_raw(data);
        }
        count
    }
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    created_at: Instant,
    last_activity: Instant,
    streams: Vec<EventStream>,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_activity: now,
            streams: Vec::new(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn streams(&self) -> &[EventStream] {
        &self.streams
    }

    pub fn first_stream_mut(&mut self) -> Option<&mut EventStream> {
        self.streams.first_mut()
    }
}

/// Every session plus the streams opened without one.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<SessionId, Session>,
    unbound: Vec<EventStream>,
    next_stream_id: StreamId,
}

impl SessionTable {
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn create(&mut self) -> SessionId {
        let id = session_id();
        self.sessions.insert(id.clone(), Session::new(id.clone()));
        id
    }

    /// Refresh a session's activity clock. Returns `false` if it is unknown.
    pub fn touch(&mut self, id: &str) -> bool {
        match self.sessions.get_mut(id) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Open streams across every session plus the unbound ones.
    pub fn stream_count(&self) -> usize {
        self.sessions
            .values()
            .map(|s| s.streams.len())
            .sum::<usize>()
            + self.unbound.len()
    }

    /// Drop unbound streams whose reader disconnected. Session streams stay
    /// until their session goes, since their logs feed replay.
    pub fn prune_unbound(&mut self) -> usize {
        let before = self.unbound.len();
        self.unbound.retain(|stream| !stream.is_closed());
        before - self.unbound.len()
    }

    /// Open a stream, bound to `session` when given and known.
    pub fn open_stream(&mut self, session: Option<&str>) -> (StreamId, UnboundedReceiver<Bytes>) {
        self.prune_unbound();
        self.next_stream_id += 1;
        let (stream, rx) = EventStream::new(self.next_stream_id);
        let id = stream.id();
        match session.and_then(|s| self.sessions.get_mut(s)) {
            Some(session) => {
                session.touch();
                session.streams.push(stream);
            }
            None => self.unbound.push(stream),
        }
        (id, rx)
    }

    pub fn stream_mut(&mut self, id: StreamId) -> Option<&mut EventStream> {
        self.sessions
            .values_mut()
            .flat_map(|s| s.streams.iter_mut())
            .chain(self.unbound.iter_mut())
            .find(|s| s.id() == id)
    }

    /// Close a stream by dropping its sender, which ends the response body
    /// once buffered frames are drained.
    pub fn close_stream(&mut self, id: StreamId) -> bool {
        for session in self.sessions.values_mut() {
            if let Some(index) = session.streams.iter().position(|s| s.id() == id) {
                session.streams.remove(index);
                return true;
            }
        }
        if let Some(index) = self.unbound.iter().position(|s| s.id() == id) {
            self.unbound.remove(index);
            return true;
        }
        false
    }

    /// The stream, in any session or unbound, that still owes a response
    /// for `request`.
    pub fn stream_waiting_for(&mut self, request: &RequestId) -> Option<&mut EventStream> {
        self.sessions
            .values_mut()
            .flat_map(|s| s.streams.iter_mut())
            .chain(self.unbound.iter_mut())
            .find(|s| s.is_waiting_for(request))
    }

    pub fn sessions_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    /// Buffered events from every stream of `session` except `skip`.
    pub fn replay_source(&self, session: &str, skip: StreamId, last_event_id: u64) -> Vec<Arc<str>> {
        self.sessions
            .get(session)
            .map(|s| {
                s.streams
                    .iter()
                    .filter(|stream| stream.id() != skip)
                    .flat_map(|stream| stream.events_after(last_event_id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove a session and close its streams. Returns how many streams
    /// were closed, or `None` if the session is unknown.
    pub fn remove(&mut self, id: &str) -> Option<usize> {
        self.sessions.remove(id).map(|session| session.streams.len())
    }

    /// Remove every session idle for longer than `timeout`.
    pub fn remove_idle(&mut self, timeout: Duration) -> Vec<SessionId> {
        let now = Instant::now();
        let expired: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.idle_for(now) > timeout)
            .map(|s| s.id().clone())
            .collect();
        for id in &expired {
            self.sessions.remove(id);
        }
        expired
    }

    /// Drop every session and unbound stream.
    pub fn clear(&mut self) -> usize {
        let closed = self.stream_count();
        self.sessions.clear();
        self.unbound.clear();
        closed
    }
}
