use futures::{future, Stream, StreamExt};
use shared::{
    domain::ProgramId,
    protocol::{CapacitySnapshot, EnrollmentSummary, ServerEvent},
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tokio_stream::wrappers::WatchStream;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};
use url::Url;

use crate::ClientError;

/// Live view of one program pushed by the server. Dropping the feed closes the socket.
pub struct ProgramFeed {
    program_id: ProgramId,
    capacity: watch::Receiver<Option<CapacitySnapshot>>,
    enrollments: watch::Receiver<Vec<EnrollmentSummary>>,
    events: broadcast::Sender<ServerEvent>,
    task: JoinHandle<()>,
}

impl ProgramFeed {
    pub(crate) async fn connect(ws_url: Url, program_id: ProgramId) -> Result<Self, ClientError> {
        let (mut ws_stream, _) = connect_async(ws_url.as_str()).await?;
        let (capacity_tx, capacity) = watch::channel(None);
        let (enrollments_tx, enrollments) = watch::channel(Vec::new());
        let (events, _) = broadcast::channel(64);

        let forward = events.clone();
        let task = tokio::spawn(async move {
            while let Some(msg) = ws_stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            let removed = matches!(event, ServerEvent::ProgramRemoved { .. });
                            match &event {
                                ServerEvent::CapacityUpdated { capacity } => {
                                    capacity_tx.send_replace(Some(*capacity));
                                }
                                ServerEvent::EnrollmentsUpdated { enrollments, .. } => {
                                    enrollments_tx.send_replace(enrollments.clone());
                                }
                                ServerEvent::Error(err) => {
                                    warn!(program_id = program_id.0, error = %err, "program feed error");
                                }
                                ServerEvent::ProgramRemoved { .. } => {}
                            }
                            let _ = forward.send(event);
                            if removed {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(program_id = program_id.0, error = %err, "invalid server event");
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(program_id = program_id.0, error = %err, "websocket receive failed");
                        break;
                    }
                }
            }
            info!(program_id = program_id.0, "program feed closed");
        });

        info!(program_id = program_id.0, %ws_url, "program feed connected");
        Ok(Self {
            program_id,
            capacity,
            enrollments,
            events,
            task,
        })
    }

    pub fn program_id(&self) -> ProgramId {
        self.program_id
    }

    /// Latest capacity seen, `None` until the first push arrives.
    pub fn capacity(&self) -> Option<CapacitySnapshot> {
        *self.capacity.borrow()
    }

    pub fn enrollments(&self) -> Vec<EnrollmentSummary> {
        self.enrollments.borrow().clone()
    }

    /// Waits for the next capacity push. `None` once the feed has ended.
    pub async fn next_capacity(&mut self) -> Option<CapacitySnapshot> {
        loop {
            self.capacity.changed().await.ok()?;
            if let Some(snapshot) = *self.capacity.borrow_and_update() {
                return Some(snapshot);
            }
        }
    }

    /// Capacity pushes as a stream, starting with the next change.
    pub fn capacity_stream(&self) -> impl Stream<Item = CapacitySnapshot> {
        WatchStream::from_changes(self.capacity.clone()).filter_map(future::ready)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// True after the server closed the socket or announced the program's removal.
    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ProgramFeed {
    fn drop(&mut self) {
        self.task.abort();
    }
}
