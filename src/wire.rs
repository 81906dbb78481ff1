use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::Engine;
use crate::limits::MAX_LINE_LEN;
use crate::notify::FeedItem;
use crate::observability;
use crate::protocol::{self, Reply, Request};

const FEED_BUFFER: usize = 256;

type Lines = Framed<TcpStream, LinesCodec>;

async fn send_reply(framed: &mut Lines, reply: &Reply) -> io::Result<()> {
    let line = serde_json::to_string(reply)?;
    framed.send(line).await.map_err(|e| match e {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "reply line too long")
        }
    })
}

/// Forward one professional's feed into the connection's queue until
/// the connection goes away.
fn spawn_forwarder(
    mut rx: broadcast::Receiver<FeedItem>,
    tx: mpsc::Sender<FeedItem>,
    professional_id: Ulid,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(item) => {
                    if tx.send(item).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(professional = %professional_id, skipped = n, "listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Serve one client: newline-delimited JSON requests in, one reply per
/// request out, plus pushed feed items for every `listen`ed professional.
pub async fn process_connection(socket: TcpStream, engine: Arc<Engine>) -> io::Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (feed_tx, mut feed_rx) = mpsc::channel::<FeedItem>(FEED_BUFFER);
    let mut listening: HashMap<Ulid, JoinHandle<()>> = HashMap::new();

    let result = loop {
        tokio::select! {
            line = framed.next() => {
                let line = match line {
                    None => break Ok(()),
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        let reply = Reply::error("limit_exceeded", "request line too long");
                        if let Err(e) = send_reply(&mut framed, &reply).await {
                            break Err(e);
                        }
                        continue;
                    }
                    Some(Err(LinesCodecError::Io(e))) => break Err(e),
                };
                if line.trim().is_empty() {
                    continue;
                }

                let reply = match serde_json::from_str::<Request>(&line) {
                    Err(e) => Reply::error("invalid_request", e.to_string()),
                    Ok(req) => {
                        let op = observability::request_label(&req);
                        let started = Instant::now();
                        let reply = match req {
                            Request::Listen { professional_id } => {
                                if engine.professional(&professional_id).is_none() {
                                    Reply::error("not_found", format!("not found: {professional_id}"))
                                } else {
                                    listening.entry(professional_id).or_insert_with(|| {
                                        spawn_forwarder(
                                            engine.notify.subscribe(professional_id),
                                            feed_tx.clone(),
                                            professional_id,
                                        )
                                    });
                                    Reply::Ok(serde_json::Value::Null)
                                }
                            }
                            Request::Unlisten { professional_id } => {
                                if let Some(task) = listening.remove(&professional_id) {
                                    task.abort();
                                }
                                Reply::Ok(serde_json::Value::Null)
                            }
                            req => protocol::handle(&engine, req).await,
                        };
                        metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => reply.status())
                            .increment(1);
                        metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
                            .record(started.elapsed().as_secs_f64());
                        if let Reply::Error(body) = &reply {
                            debug!(op, code = body.code, "request failed: {}", body.message);
                        }
                        reply
                    }
                };
                if let Err(e) = send_reply(&mut framed, &reply).await {
                    break Err(e);
                }
            }
            Some(item) = feed_rx.recv() => {
                if let Err(e) = send_reply(&mut framed, &Reply::Feed(item)).await {
                    break Err(e);
                }
            }
        }
    };

    for (_, task) in listening {
        task.abort();
    }
    result
}
