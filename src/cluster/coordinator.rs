//! Coordinator Side
//!
//! Serves one worker channel against the coordinator's backend. Requests
//! of a channel are handled strictly one after another, so a worker always
//! observes its own calls in the order it issued them. Responses go out
//! through a separate writer, so reading the next request never waits for
//! a large response to drain.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use super::protocol::{self, Envelope, Request, Response, WireError};
use super::{ChannelIo, WorkerHandle};
use crate::cache::backend::{CacheBackend, PartInfo};
use crate::cache::key::CacheKey;
use crate::error::Result;

/// Encoded responses waiting for the writer
const RESPONSE_QUEUE_DEPTH: usize = 64;

type Channel = Framed<Box<dyn ChannelIo>, LengthDelimitedCodec>;

/// Serve requests from `worker` until its channel closes
pub async fn serve(backend: Arc<dyn CacheBackend>, worker: WorkerHandle) {
    let label = worker.label().to_string();
    let (sink, stream) = Framed::new(worker.into_io(), protocol::codec()).split();
    let (responses, outgoing) = mpsc::channel(RESPONSE_QUEUE_DEPTH);

    debug!(worker = %label, backend = backend.name(), "Serving worker channel");

    let (served, ()) = tokio::join!(
        read_requests(backend.as_ref(), &label, stream, responses),
        write_responses(&label, sink, outgoing),
    );

    info!(worker = %label, requests = served, "Worker channel closed");
}

/// Handle requests in arrival order, queueing each response
async fn read_requests(
    backend: &dyn CacheBackend,
    label: &str,
    mut stream: SplitStream<Channel>,
    responses: mpsc::Sender<Bytes>,
) -> u64 {
    let mut served = 0u64;
    while let Some(frame) = stream.next().await {
        let frame: BytesMut = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!(worker = %label, error = %e, "Worker channel read failed");
                break;
            }
        };

        let (envelope, payload) = match protocol::decode_frame::<Request>(frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(worker = %label, error = %e, "Malformed request, closing channel");
                break;
            }
        };

        let operation = envelope.body.operation();
        let (response, payload) = handle(backend, envelope.body, payload).await;
        let reply = Envelope {
            id: envelope.id,
            body: response,
        };

        let frame = match protocol::encode_frame(&reply, &payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(worker = %label, operation, error = %e, "Cannot encode response");
                break;
            }
        };
        if responses.send(frame).await.is_err() {
            break;
        }
        served += 1;
    }
    served
}

/// Write queued responses until the reader is done or the channel breaks
async fn write_responses(
    label: &str,
    mut sink: SplitSink<Channel, Bytes>,
    mut outgoing: mpsc::Receiver<Bytes>,
) {
    while let Some(frame) = outgoing.recv().await {
        if let Err(e) = sink.send(frame).await {
            warn!(worker = %label, error = %e, "Worker channel write failed");
            return;
        }
    }
    let _ = sink.close().await;
}

async fn handle(
    backend: &dyn CacheBackend,
    request: Request,
    payload: Bytes,
) -> (Response, Vec<Bytes>) {
    let operation = request.operation();
    match dispatch(backend, request, payload).await {
        Ok(reply) => reply,
        Err(e) => {
            debug!(operation, error = %e, "Worker request failed");
            (Response::Error(WireError::from(&e)), Vec::new())
        }
    }
}

async fn dispatch(
    backend: &dyn CacheBackend,
    request: Request,
    payload: Bytes,
) -> Result<(Response, Vec<Bytes>)> {
    match request {
        Request::Ping => Ok((Response::Pong, Vec::new())),
        Request::GetInfo { key } => {
            let info = backend.get_info(&key).await?;
            Ok((Response::Info { info }, Vec::new()))
        }
        Request::GetPart { key, tag } => {
            let data = backend.get_read_stream(&key, tag).await?.read_all().await?;
            Ok((
                Response::Part {
                    size: data.len() as u64,
                },
                vec![data],
            ))
        }
        Request::Commit { key, parts } => {
            commit(backend, key, &parts, payload).await?;
            Ok((Response::Committed, Vec::new()))
        }
    }
}

/// Replay a shipped commit through the backend's own transaction protocol
async fn commit(
    backend: &dyn CacheBackend,
    key: CacheKey,
    parts: &[PartInfo],
    payload: Bytes,
) -> Result<()> {
    let chunks = protocol::split_parts(parts, payload)?;
    let trx = backend.create_transaction(key).await?;

    for (tag, data) in chunks {
        let staged = trx
            .get_write_stream(tag, data.len() as u64)
            .and_then(|mut writer| {
                writer.write(&data)?;
                writer.close()
            });
        if let Err(e) = staged {
            let _ = trx.abandon();
            return Err(e);
        }
    }

    backend.end_transaction(&trx).await
}
