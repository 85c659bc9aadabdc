use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use weft_core::event::is_for_run;
use weft_core::types::{ExecutionEvent, RunEvent, RunId};
use weft_engine::WorkflowService;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Ordered events of one run: everything already stored, then live events
/// from the bus, without duplicates or gaps. Ends after `workflow_end`.
///
/// The bus subscription is taken before the store is read, and the executor
/// records each event before publishing it, so every event is seen at least
/// once; duplicates are dropped by `seq`. A lagging subscription is repaired
/// from the store.
pub struct RunEventFeed {
    service: Arc<WorkflowService>,
    run_id: RunId,
    live: broadcast::Receiver<RunEvent>,
    pending: VecDeque<RunEvent>,
    next_seq: u64,
    backfill: bool,
    finished: bool,
}

impl RunEventFeed {
    pub fn new(service: Arc<WorkflowService>, run_id: RunId) -> Self {
        let live = service.subscribe();
        Self {
            service,
            run_id,
            live,
            pending: VecDeque::new(),
            next_seq: 0,
            backfill: true,
            finished: false,
        }
    }

    /// Sequence number of the last event handed out.
    pub fn last_seq(&self) -> Option<u64> {
        self.next_seq.checked_sub(1)
    }

    /// Cancel safe: an interrupted call loses no events.
    pub async fn next(&mut self) -> Option<RunEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                if event.seq < self.next_seq {
                    continue;
                }
                self.next_seq = event.seq + 1;
                if event.is_terminal() {
                    self.finished = true;
                    self.pending.clear();
                }
                return Some(event);
            }
            if self.finished {
                return None;
            }

            if self.backfill {
                match self.service.run_events(&self.run_id).await {
                    Ok(events) => {
                        self.backfill = false;
                        let next = self.next_seq;
                        self.pending
                            .extend(events.into_iter().filter(|e| e.seq >= next));
                        continue;
                    }
                    Err(e) => {
                        warn!(run_id = %self.run_id, error = %e, "Failed to load stored events");
                        return None;
                    }
                }
            }

            match self.live.recv().await {
                Ok(event) if is_for_run(&event, &self.run_id) => self.pending.push_back(event),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => {
                    warn!(run_id = %self.run_id, skipped = n, "Event stream lagged, reloading from store");
                    self.backfill = true;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

async fn send<S>(sink: &mut S, event: &RunEvent) -> bool
where
    S: futures::Sink<Message> + Unpin,
{
    match serde_json::to_string(event) {
        Ok(json) => sink.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize run event");
            true
        }
    }
}

/// Stream a run over a WebSocket until `workflow_end` or the client leaves.
pub async fn serve_socket(socket: WebSocket, service: Arc<WorkflowService>, run_id: RunId) {
    debug!(run_id = %run_id, "Run stream opened");
    let (mut sink, mut incoming) = socket.split();
    let mut feed = RunEventFeed::new(service, run_id.clone());
    let mut keepalive =
        tokio::time::interval_at(tokio::time::Instant::now() + KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);

    loop {
        tokio::select! {
            event = feed.next() => {
                let Some(event) = event else {
                    break;
                };
                let terminal = event.is_terminal();
                if !send(&mut sink, &event).await {
                    return;
                }
                if terminal {
                    break;
                }
            }
            _ = keepalive.tick() => {
                let ping = RunEvent {
                    run_id: run_id.clone(),
                    seq: feed.last_seq().unwrap_or(0),
                    timestamp: Utc::now(),
                    event: ExecutionEvent::Keepalive,
                };
                if !send(&mut sink, &ping).await {
                    return;
                }
            }
            msg = incoming.next() => {
                match msg {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => {
                        debug!(run_id = %run_id, "Run stream closed by client");
                        return;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    debug!(run_id = %run_id, "Run stream finished");
}
