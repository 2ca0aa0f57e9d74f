//! Worker Side
//!
//! [`ClusterWorker`] is a backend that holds nothing but a channel to the
//! coordinator. Reads are forwarded as they come. Writes are staged in a
//! local [`PutTransaction`] and shipped as a single `Commit` when the
//! transaction is finalized, so the coordinator never sees half an entry.
//!
//! One connection task owns the channel. Calls reach it through an mpsc
//! queue and get their response through a oneshot matched by request id.
//! Sending and receiving run side by side, so a large request being written
//! never stops responses from being read.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{self, Envelope, Request, Response};
use super::ChannelIo;
use crate::cache::backend::{CacheBackend, EntryInfo, PartInfo, ReadStream};
use crate::cache::key::{CacheKey, PartTag, PartTagSet};
use crate::cache::options::{CacheOptions, MembufOptions, CACHE_MEMBUF};
use crate::cache::transaction::PutTransaction;
use crate::error::{Error, Result};

/// Calls queued ahead of the connection task
const CALL_QUEUE_DEPTH: usize = 256;

type Reply = oneshot::Sender<Result<(Response, Bytes)>>;

type Channel = Framed<Box<dyn ChannelIo>, LengthDelimitedCodec>;

/// Replies awaiting a response, by request id
type Pending = Mutex<HashMap<u64, Reply>>;

struct Call {
    request: Request,
    payload: Vec<Bytes>,
    reply: Reply,
}

/// Proxy backend forwarding every call to the cluster coordinator
pub struct ClusterWorker {
    calls: mpsc::Sender<Call>,
    tags: RwLock<PartTagSet>,
    shutdown: CancellationToken,
}

impl ClusterWorker {
    /// Backend name
    pub const NAME: &'static str = "cache_cluster_worker";

    /// Start a worker over a connected channel. Needs a running tokio runtime.
    pub fn connect(io: impl ChannelIo) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::InitError(format!("no async runtime for cluster worker: {}", e)))?;

        let (calls, queue) = mpsc::channel(CALL_QUEUE_DEPTH);
        let shutdown = CancellationToken::new();
        let io: Box<dyn ChannelIo> = Box::new(io);
        runtime.spawn(connection_loop(
            Framed::new(io, protocol::codec()),
            queue,
            shutdown.clone(),
        ));

        Ok(Self {
            calls,
            tags: RwLock::new(PartTagSet::default()),
            shutdown,
        })
    }

    /// Whether the connection task has stopped
    pub fn is_closed(&self) -> bool {
        self.calls.is_closed()
    }

    async fn call(&self, request: Request, payload: Vec<Bytes>) -> Result<(Response, Bytes)> {
        let (reply, response) = oneshot::channel();
        self.calls
            .send(Call {
                request,
                payload,
                reply,
            })
            .await
            .map_err(|_| Error::CoordinatorUnavailable("worker channel is closed".into()))?;

        let (response, payload) = response
            .await
            .map_err(|_| Error::CoordinatorUnavailable("connection task stopped".into()))??;

        match response {
            Response::Error(err) => Err(err.into_error()),
            response => Ok((response, payload)),
        }
    }
}

fn unexpected(operation: &str, response: &Response) -> Error {
    Error::Protocol(format!("unexpected response to {}: {:?}", operation, response))
}

impl Drop for ClusterWorker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for ClusterWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterWorker")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl CacheBackend for ClusterWorker {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn init(&self, options: &CacheOptions) -> Result<()> {
        let membuf: MembufOptions = options.backend(CACHE_MEMBUF)?;
        *self.tags.write() = membuf.part_tags;

        match self.call(Request::Ping, Vec::new()).await? {
            (Response::Pong, _) => {
                info!("Cluster worker connected to coordinator");
                Ok(())
            }
            (other, _) => Err(unexpected("ping", &other)),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        Ok(())
    }

    async fn get_info(&self, key: &CacheKey) -> Result<Option<EntryInfo>> {
        match self.call(Request::GetInfo { key: *key }, Vec::new()).await? {
            (Response::Info { info }, _) => Ok(info),
            (other, _) => Err(unexpected("get_info", &other)),
        }
    }

    async fn get_read_stream(&self, key: &CacheKey, tag: PartTag) -> Result<ReadStream> {
        self.tags.read().validate(tag)?;

        match self.call(Request::GetPart { key: *key, tag }, Vec::new()).await? {
            (Response::Part { size }, payload) => {
                if payload.len() as u64 != size {
                    return Err(Error::Protocol(format!(
                        "part announced {} bytes, carried {}",
                        size,
                        payload.len()
                    )));
                }
                Ok(ReadStream::from_bytes(payload))
            }
            (other, _) => Err(unexpected("get_part", &other)),
        }
    }

    async fn create_transaction(&self, key: CacheKey) -> Result<PutTransaction> {
        Ok(PutTransaction::new(key, self.tags.read().clone()))
    }

    async fn end_transaction(&self, trx: &PutTransaction) -> Result<()> {
        let parts = trx.seal()?;
        let infos: Vec<PartInfo> = parts
            .iter()
            .map(|p| PartInfo {
                tag: p.tag,
                size: p.size(),
            })
            .collect();
        let payload = parts.into_iter().map(|p| p.data).collect();

        let request = Request::Commit {
            key: *trx.key(),
            parts: infos,
        };
        match self.call(request, payload).await {
            Ok((Response::Committed, _)) => trx.mark_committed(),
            Ok((other, _)) => {
                trx.fail();
                Err(unexpected("commit", &other))
            }
            Err(e) => {
                trx.fail();
                debug!(trx = %trx.id(), key = %trx.key(), error = %e, "Remote commit failed");
                Err(e)
            }
        }
    }
}

/// Own the channel: write queued calls, route responses by id
async fn connection_loop(
    framed: Channel,
    mut queue: mpsc::Receiver<Call>,
    shutdown: CancellationToken,
) {
    let (sink, stream) = framed.split();
    let pending: Pending = Mutex::new(HashMap::new());

    let reason = tokio::select! {
        _ = shutdown.cancelled() => None,
        reason = send_calls(sink, &mut queue, &pending) => reason,
        reason = route_responses(stream, &pending) => Some(reason),
    };

    let in_flight = pending.lock().len();
    let reason = match reason {
        Some(reason) => {
            warn!(reason = %reason, in_flight, "Lost cluster coordinator");
            reason
        }
        None => {
            debug!("Cluster worker connection closed");
            "worker shut down".to_string()
        }
    };

    queue.close();
    for (_, reply) in pending.lock().drain() {
        let _ = reply.send(Err(Error::CoordinatorUnavailable(reason.clone())));
    }
    while let Ok(call) = queue.try_recv() {
        let _ = call.reply.send(Err(Error::CoordinatorUnavailable(reason.clone())));
    }
}

/// Write queued calls in order. Returns a reason if the channel broke.
async fn send_calls(
    mut sink: SplitSink<Channel, Bytes>,
    queue: &mut mpsc::Receiver<Call>,
    pending: &Pending,
) -> Option<String> {
    let mut next_id = 0u64;
    while let Some(call) = queue.recv().await {
        next_id += 1;
        let envelope = Envelope {
            id: next_id,
            body: call.request,
        };
        let frame = match protocol::encode_frame(&envelope, &call.payload) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = call.reply.send(Err(e));
                continue;
            }
        };

        // Registered first: the response may arrive before `send` returns
        pending.lock().insert(next_id, call.reply);
        if let Err(e) = sink.send(frame).await {
            return Some(format!("send failed: {}", e));
        }
    }
    None
}

/// Hand each response to the call waiting for it
async fn route_responses(mut stream: SplitStream<Channel>, pending: &Pending) -> String {
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => return format!("read failed: {}", e),
        };
        let (envelope, payload) = match protocol::decode_frame::<Response>(frame) {
            Ok(decoded) => decoded,
            Err(e) => return format!("malformed response: {}", e),
        };

        let reply = pending.lock().remove(&envelope.id);
        match reply {
            Some(reply) => {
                let _ = reply.send(Ok((envelope.body, payload)));
            }
            None => warn!(id = envelope.id, "Response for unknown request"),
        }
    }
    "coordinator closed the channel".to_string()
}
