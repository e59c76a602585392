//! Task that owns the provider tree and runs one call at a time.

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::provider::BoxedProvider;
use crate::time::TimeRange;
use crate::types::{ExtensionPoint, InitializationResult, MessageEvent, Subscription};

pub(crate) enum FetchRequest {
    Initialize,
    GetMessages {
        generation: u64,
        range: TimeRange,
        subscriptions: Vec<Subscription>,
    },
    Close,
}

pub(crate) enum FetchResponse {
    Initialized(Result<InitializationResult>),
    Messages {
        generation: u64,
        range: TimeRange,
        result: Result<Vec<MessageEvent>>,
    },
    Closed,
}

/// Side-channel output of the provider tree.
pub(crate) enum ProviderCallback {
    Progress(f64),
    Metadata(String, Value),
}

pub(crate) struct Fetcher {
    pub requests: flume::Sender<FetchRequest>,
    pub responses: flume::Receiver<FetchResponse>,
    pub callbacks: flume::Receiver<ProviderCallback>,
    pub task: JoinHandle<()>,
}

pub(crate) fn spawn_fetcher(mut provider: BoxedProvider) -> Fetcher {
    let (request_tx, request_rx) = flume::unbounded::<FetchRequest>();
    let (response_tx, response_rx) = flume::unbounded::<FetchResponse>();
    let (callback_tx, callback_rx) = flume::unbounded::<ProviderCallback>();

    let task = tokio::spawn(async move {
        while let Ok(request) = request_rx.recv_async().await {
            let response = match request {
                FetchRequest::Initialize => {
                    let progress_tx = callback_tx.clone();
                    let metadata_tx = callback_tx.clone();
                    let ext = ExtensionPoint::new(
                        move |fraction| {
                            let _ = progress_tx.send(ProviderCallback::Progress(fraction));
                        },
                        move |key, value| {
                            let _ = metadata_tx
                                .send(ProviderCallback::Metadata(key.to_string(), value));
                        },
                    );
                    FetchResponse::Initialized(provider.initialize(ext).await)
                }
                FetchRequest::GetMessages {
                    generation,
                    range,
                    subscriptions,
                } => FetchResponse::Messages {
                    generation,
                    range,
                    result: provider.get_messages(range, &subscriptions).await,
                },
                FetchRequest::Close => {
                    if let Err(e) = provider.close().await {
                        log::warn!("Provider close failed: {e}");
                    }
                    let _ = response_tx.send(FetchResponse::Closed);
                    return;
                }
            };
            if response_tx.send(response).is_err() {
                break;
            }
        }
        // Player went away without closing.
        if let Err(e) = provider.close().await {
            log::debug!("Provider close after shutdown failed: {e}");
        }
    });

    Fetcher {
        requests: request_tx,
        responses: response_rx,
        callbacks: callback_rx,
        task,
    }
}
