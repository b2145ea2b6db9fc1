//! Echo responder served by the binary.

use bytes::Bytes;
use futures::future::{self, BoxFuture};
use futures::stream::{self, StreamExt};
use rsocket_core::{Payload, PayloadFlux, PayloadStream, Responder, ResponseFuture};

/// Credit the echo channel grants the requester per batch.
const CHANNEL_BATCH: u32 = 64;

/// Echoes every interaction back to the requester.
///
/// - request-response returns the request unchanged
/// - request-stream emits one item per whitespace-separated word of the data
/// - request-channel echoes every inbound item
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoResponder;

impl Responder for EchoResponder {
    fn fire_and_forget(&self, payload: Payload) -> BoxFuture<'static, ()> {
        tracing::info!("fire-and-forget: {} bytes", payload.len());
        Box::pin(future::ready(()))
    }

    fn request_response(&self, payload: Payload) -> ResponseFuture {
        tracing::debug!("request-response: {} bytes", payload.len());
        Box::pin(future::ready(Ok(Some(payload))))
    }

    fn request_stream(&self, payload: Payload) -> PayloadFlux {
        let metadata = payload.metadata().cloned();
        let words: Vec<Payload> = payload
            .data()
            .split(|b| b.is_ascii_whitespace())
            .filter(|word| !word.is_empty())
            .map(|word| Payload::new(Bytes::copy_from_slice(word), metadata.clone()))
            .collect();
        tracing::debug!("request-stream: {} items", words.len());
        stream::iter(words.into_iter().map(Ok)).boxed()
    }

    fn request_channel(&self, first: Payload, inbound: PayloadStream) -> PayloadFlux {
        inbound.request(CHANNEL_BATCH);
        let inbound = stream::unfold((inbound, CHANNEL_BATCH), |(mut inbound, left)| async move {
            let item = inbound.next().await?;
            let left = if left == 1 {
                inbound.request(CHANNEL_BATCH);
                CHANNEL_BATCH
            } else {
                left - 1
            };
            Some((item, (inbound, left)))
        });
        stream::once(future::ready(Ok(first))).chain(inbound).boxed()
    }

    fn metadata_push(&self, metadata: Bytes) -> BoxFuture<'static, ()> {
        tracing::info!("metadata push: {} bytes", metadata.len());
        Box::pin(future::ready(()))
    }
}
