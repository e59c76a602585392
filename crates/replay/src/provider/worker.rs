//! Worker boundary: runs a subtree on its own thread behind JSON frames.
//!
//! [`WorkerProvider`] is the local stub. It ships the child's descriptor to a
//! [`WorkerExecutor`], which rebuilds the subtree and answers requests. The
//! two sides share nothing but a pair of `flume` channels carrying text.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::rpc::{
    CallbackKind, GetMessagesParams, GetMessagesResult, InitializeParams, MetadataData, Reply,
    Request, METHOD_CLOSE, METHOD_GET_MESSAGES, METHOD_INITIALIZE,
};
use super::{build_provider, BoxedProvider, DataProvider};
use crate::context::ReplayContext;
use crate::error::{ReplayError, Result};
use crate::time::TimeRange;
use crate::types::{
    ExtensionPoint, InitializationResult, MessageEvent, ProviderDescriptor, Subscription,
};

const WORKER_THREAD_NAME: &str = "replay-worker";

#[derive(Debug, Clone)]
enum Broken {
    Disconnected,
    Protocol(String),
}

impl Broken {
    fn error(&self) -> ReplayError {
        match self {
            Broken::Disconnected => ReplayError::WorkerDisconnected,
            Broken::Protocol(reason) => ReplayError::WorkerProtocol(reason.clone()),
        }
    }
}

/// Local stub forwarding calls to an executor.
///
/// Calls are never pipelined: `&mut self` allows one outstanding request.
/// A reply or callback for any other id belongs to an abandoned call and is
/// dropped. Once the channel breaks every call fails with the same fatal
/// error.
pub struct WorkerProvider {
    descriptor: ProviderDescriptor,
    tx: Option<flume::Sender<String>>,
    rx: flume::Receiver<String>,
    next_id: u64,
    ext: ExtensionPoint,
    broken: Option<Broken>,
    closed: bool,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl WorkerProvider {
    /// Start an executor thread for `descriptor` and connect to it.
    pub fn spawn(descriptor: ProviderDescriptor, ctx: ReplayContext) -> Result<Self> {
        let (request_tx, request_rx) = flume::unbounded::<String>();
        let (reply_tx, reply_rx) = flume::unbounded::<String>();

        let thread = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        log::error!("Failed to start worker runtime: {e}");
                        return;
                    }
                };
                runtime.block_on(WorkerExecutor::new(ctx, request_rx, reply_tx).run());
            })?;

        let mut stub = Self::connect(descriptor, request_tx, reply_rx);
        stub.thread = Some(thread);
        Ok(stub)
    }

    /// Connect to an executor over existing channels.
    pub fn connect(
        descriptor: ProviderDescriptor,
        tx: flume::Sender<String>,
        rx: flume::Receiver<String>,
    ) -> Self {
        Self {
            descriptor,
            tx: Some(tx),
            rx,
            next_id: 0,
            ext: ExtensionPoint::noop(),
            broken: None,
            closed: false,
            thread: None,
        }
    }

    fn fail(&mut self, broken: Broken) -> ReplayError {
        log::error!("Worker boundary failed: {}", broken.error());
        let error = broken.error();
        self.broken = Some(broken);
        self.tx = None;
        error
    }

    fn deliver(&self, kind: CallbackKind, data: Value) {
        match kind {
            CallbackKind::Progress => {
                if let Some(fraction) = data.as_f64() {
                    self.ext.progress(fraction);
                }
            }
            CallbackKind::ReportMetadata => match serde_json::from_value::<MetadataData>(data) {
                Ok(metadata) => self.ext.report_metadata(&metadata.key, metadata.value),
                Err(e) => log::warn!("Dropping malformed metadata callback: {e}"),
            },
        }
    }

    async fn call<P: Serialize, R: DeserializeOwned>(
        &mut self,
        method: &str,
        params: P,
    ) -> Result<R> {
        if self.closed {
            return Err(ReplayError::Closed);
        }
        if let Some(broken) = &self.broken {
            return Err(broken.error());
        }
        let Some(tx) = self.tx.clone() else {
            return Err(ReplayError::Closed);
        };

        self.next_id += 1;
        let id = self.next_id;
        let frame = serde_json::to_string(&Request {
            id,
            method: method.to_string(),
            params: serde_json::to_value(params)?,
        })?;
        if tx.send_async(frame).await.is_err() {
            return Err(self.fail(Broken::Disconnected));
        }

        loop {
            let text = match self.rx.recv_async().await {
                Ok(text) => text,
                Err(_) => return Err(self.fail(Broken::Disconnected)),
            };
            let reply: Reply = match serde_json::from_str(&text) {
                Ok(reply) => reply,
                Err(e) => return Err(self.fail(Broken::Protocol(e.to_string()))),
            };
            if reply.id() != id {
                log::debug!("Discarding frame for abandoned call {}", reply.id());
                continue;
            }
            match reply {
                Reply::Callback { callback, data, .. } => self.deliver(callback, data),
                Reply::Error { error, .. } => return Err(ReplayError::Remote(error)),
                Reply::Success { result, .. } => {
                    return serde_json::from_value(result)
                        .map_err(|e| self.fail(Broken::Protocol(e.to_string())));
                }
            }
        }
    }
}

#[async_trait]
impl DataProvider for WorkerProvider {
    async fn initialize(&mut self, ext: ExtensionPoint) -> Result<InitializationResult> {
        self.ext = ext;
        let params = InitializeParams {
            child_descriptor: self.descriptor.clone(),
        };
        self.call(METHOD_INITIALIZE, params).await
    }

    async fn get_messages(
        &mut self,
        range: TimeRange,
        subscriptions: &[Subscription],
    ) -> Result<Vec<MessageEvent>> {
        let params = GetMessagesParams {
            range,
            subscriptions: subscriptions.to_vec(),
        };
        let result: GetMessagesResult = self.call(METHOD_GET_MESSAGES, params).await?;
        Ok(result.events)
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.broken.is_none() {
            if let Err(e) = self.call::<_, Value>(METHOD_CLOSE, json!({})).await {
                log::warn!("Worker close failed: {e}");
            }
        }
        self.closed = true;
        self.tx = None;
        if let Some(thread) = self.thread.take() {
            let joined = tokio::task::spawn_blocking(move || thread.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                log::warn!("Worker thread did not shut down cleanly");
            }
        }
        Ok(())
    }
}

/// Remote side of the boundary.
///
/// Rebuilds the subtree on `initialize` and serves requests one at a time
/// until the stub hangs up.
pub struct WorkerExecutor {
    ctx: ReplayContext,
    rx: flume::Receiver<String>,
    tx: flume::Sender<String>,
    provider: Option<BoxedProvider>,
    current_id: Arc<AtomicU64>,
}

impl WorkerExecutor {
    pub fn new(ctx: ReplayContext, rx: flume::Receiver<String>, tx: flume::Sender<String>) -> Self {
        Self {
            ctx,
            rx,
            tx,
            provider: None,
            current_id: Arc::new(AtomicU64::new(0)),
        }
    }

    fn extension_point(&self) -> ExtensionPoint {
        let progress_tx = self.tx.clone();
        let progress_id = self.current_id.clone();
        let metadata_tx = self.tx.clone();
        let metadata_id = self.current_id.clone();
        ExtensionPoint::new(
            move |fraction| {
                send_reply(
                    &progress_tx,
                    &Reply::Callback {
                        id: progress_id.load(Ordering::SeqCst),
                        callback: CallbackKind::Progress,
                        data: json!(fraction),
                    },
                );
            },
            move |key, value| {
                send_reply(
                    &metadata_tx,
                    &Reply::Callback {
                        id: metadata_id.load(Ordering::SeqCst),
                        callback: CallbackKind::ReportMetadata,
                        data: json!({ "key": key, "value": value }),
                    },
                );
            },
        )
    }

    fn provider(&mut self) -> Result<&mut BoxedProvider> {
        self.provider
            .as_mut()
            .ok_or(ReplayError::NotInitialized("worker"))
    }

    async fn handle(&mut self, request: Request) -> Result<Value> {
        match request.method.as_str() {
            METHOD_INITIALIZE => {
                let params: InitializeParams = serde_json::from_value(request.params)?;
                let mut provider = build_provider(&params.child_descriptor, &self.ctx)?;
                let result = provider.initialize(self.extension_point()).await?;
                self.provider = Some(provider);
                Ok(serde_json::to_value(result)?)
            }
            METHOD_GET_MESSAGES => {
                let params: GetMessagesParams = serde_json::from_value(request.params)?;
                let events = self
                    .provider()?
                    .get_messages(params.range, &params.subscriptions)
                    .await?;
                Ok(serde_json::to_value(GetMessagesResult { events })?)
            }
            METHOD_CLOSE => {
                if let Some(provider) = self.provider.as_mut() {
                    provider.close().await?;
                }
                Ok(Value::Null)
            }
            other => Err(ReplayError::WorkerProtocol(format!("unknown method '{other}'"))),
        }
    }

    pub async fn run(mut self) {
        log::debug!("Worker executor started");
        while let Ok(text) = self.rx.recv_async().await {
            let request: Request = match serde_json::from_str(&text) {
                Ok(request) => request,
                Err(e) => {
                    log::warn!("Worker ignoring malformed request: {e}");
                    continue;
                }
            };
            let id = request.id;
            self.current_id.store(id, Ordering::SeqCst);
            let reply = match self.handle(request).await {
                Ok(result) => Reply::Success { id, result },
                Err(e) => Reply::Error {
                    id,
                    error: e.to_string(),
                },
            };
            if !send_reply(&self.tx, &reply) {
                break;
            }
        }
        if let Some(provider) = self.provider.as_mut() {
            if let Err(e) = provider.close().await {
                log::warn!("Worker subtree close failed: {e}");
            }
        }
        log::debug!("Worker executor stopped");
    }
}

fn send_reply(tx: &flume::Sender<String>, reply: &Reply) -> bool {
    match serde_json::to_string(reply) {
        Ok(text) => tx.send(text).is_ok(),
        Err(e) => {
            log::warn!("Failed to encode worker reply: {e}");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Time;
    use serde_json::json;

    fn fake_executor() -> (WorkerProvider, flume::Receiver<String>, flume::Sender<String>) {
        let (request_tx, request_rx) = flume::unbounded();
        let (reply_tx, reply_rx) = flume::unbounded();
        let stub = WorkerProvider::connect(
            ProviderDescriptor::new("mcap", json!({ "path": "a.mcap" })),
            request_tx,
            reply_rx,
        );
        (stub, request_rx, reply_tx)
    }

    fn empty_init() -> Value {
        json!({
            "topics": [],
            "datatypes": {},
            "timeRange": { "start": { "sec": 0, "nsec": 0 }, "end": { "sec": 1, "nsec": 0 } }
        })
    }

    #[tokio::test]
    async fn test_stale_replies_are_discarded() {
        let (mut stub, requests, replies) = fake_executor();
        let server = tokio::spawn(async move {
            let text = requests.recv_async().await.unwrap();
            let request: Request = serde_json::from_str(&text).unwrap();
            assert_eq!(request.method, METHOD_INITIALIZE);
            assert_eq!(request.params["childDescriptor"]["name"], "mcap");
            let stale = json!({ "id": request.id + 100, "result": null });
            replies.send(stale.to_string()).unwrap();
            let callback = json!({ "id": request.id, "callback": "progress", "data": 0.5 });
            replies.send(callback.to_string()).unwrap();
            let done = json!({ "id": request.id, "result": empty_init() });
            replies.send(done.to_string()).unwrap();
            replies
        });

        let progress = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = progress.clone();
        let ext = ExtensionPoint::new(move |f| sink.lock().unwrap().push(f), |_, _| {});
        let init = stub.initialize(ext).await.unwrap();
        assert_eq!(init.time_range.end, Time::new(1, 0));
        assert_eq!(*progress.lock().unwrap(), vec![0.5]);
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_disconnect_is_fatal_and_sticky() {
        let (mut stub, requests, replies) = fake_executor();
        drop(replies);
        let err = stub.initialize(ExtensionPoint::noop()).await.unwrap_err();
        assert!(matches!(err, ReplayError::WorkerDisconnected));
        assert!(err.is_fatal());
        let again = stub
            .get_messages(TimeRange::instant(Time::ZERO), &[])
            .await
            .unwrap_err();
        assert!(matches!(again, ReplayError::WorkerDisconnected));
        drop(requests);
        stub.close().await.unwrap();
        stub.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_reply_is_fatal() {
        let (mut stub, _requests, replies) = fake_executor();
        replies.send("not json".into()).unwrap();
        let err = stub.initialize(ExtensionPoint::noop()).await.unwrap_err();
        assert!(matches!(err, ReplayError::WorkerProtocol(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_remote_error_is_not_fatal() {
        let (mut stub, requests, replies) = fake_executor();
        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let text = requests.recv_async().await.unwrap();
                let request: Request = serde_json::from_str(&text).unwrap();
                let reply = if request.method == METHOD_INITIALIZE {
                    json!({ "id": request.id, "result": empty_init() })
                } else {
                    json!({ "id": request.id, "error": "child failed" })
                };
                replies.send(reply.to_string()).unwrap();
            }
        });
        stub.initialize(ExtensionPoint::noop()).await.unwrap();
        let err = stub
            .get_messages(TimeRange::instant(Time::ZERO), &[Subscription::raw("/a")])
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::Remote(ref msg) if msg == "child failed"));
        assert!(!err.is_fatal());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_executor_reports_unknown_provider() {
        let (request_tx, request_rx) = flume::unbounded();
        let (reply_tx, reply_rx) = flume::unbounded();
        let executor = WorkerExecutor::new(ReplayContext::default(), request_rx, reply_tx);
        let task = tokio::spawn(executor.run());
        let mut stub = WorkerProvider::connect(
            ProviderDescriptor::new("bag", json!({})),
            request_tx,
            reply_rx,
        );
        let err = stub.initialize(ExtensionPoint::noop()).await.unwrap_err();
        assert!(matches!(err, ReplayError::Remote(ref msg) if msg.contains("bag")));
        stub.close().await.unwrap();
        task.await.unwrap();
    }
}
