use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;

use async_stream::stream;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;
use tonic::Request;

use crate::breaker::CircuitBreaker;
use crate::comms::{ResiliencyRequest, ResiliencyResponse};
use crate::deadline::Deadline;
use crate::error::CallError;
use crate::metadata;
use crate::port::{RequestStream, ResiliencyPort, ResponseStream};

/// Lazy response sequence handed back for the streaming shapes. Ends cleanly
/// on end-of-stream; a fatal error is yielded once and then the stream
/// terminates. Items already delivered are never retracted.
pub type CallStream =
    Pin<Box<dyn Stream<Item = Result<ResiliencyResponse, CallError>> + Send + 'static>>;

/// A call result paired with whatever header metadata the remote side sent.
/// An absent-metadata response is an empty map, not an error.
#[derive(Debug)]
pub struct Exchange<T> {
    pub value: T,
    pub metadata: BTreeMap<String, String>,
}

impl<T> Exchange<T> {
    pub fn has_metadata(&self) -> bool {
        !self.metadata.is_empty()
    }
}

/// Uniform entry points for the four RPC shapes over an abstract port.
///
/// Each operation takes an optional timeout bounding the call (unary shapes)
/// or the whole session (streaming shapes). Errors from the transport are
/// forwarded to the caller untouched; nothing is retried locally.
pub struct ResiliencyAdapter<P> {
    port: P,
}

fn prepare<T>(message: T, deadline: &Deadline, outgoing: Option<MetadataMap>) -> Request<T> {
    let mut request = Request::new(message);

    if let Some(limit) = deadline.limit() {
        // Hint for the remote side; local enforcement races the deadline.
        request.set_timeout(limit);
    }

    if let Some(md) = outgoing {
        metadata::attach(&md, request.metadata_mut());
    }

    request
}

fn warn_err(shape: &'static str) -> impl FnOnce(CallError) -> CallError {
    move |err| {
        tracing::warn!(shape, error = %err, "call failed");
        err
    }
}

/// Bound a receive-only session to its deadline: each pull is raced against
/// the same instant, and the first error (deadline included) terminates the
/// stream after being yielded.
fn bound_session(deadline: Deadline, mut inbound: ResponseStream) -> CallStream {
    Box::pin(stream! {
        loop {
            let item = match deadline.bound_value(inbound.next()).await {
                Ok(item) => item,
                Err(expired) => {
                    yield Err(expired);
                    break;
                }
            };

            match item {
                Some(Ok(response)) => yield Ok(response),
                Some(Err(status)) => {
                    yield Err(CallError::from(status));
                    break;
                }
                None => break,
            }
        }
    })
}

impl<P: ResiliencyPort> ResiliencyAdapter<P> {
    pub fn new(port: P) -> ResiliencyAdapter<P> {
        ResiliencyAdapter { port }
    }

    /// Single request, single response; no local retry.
    pub async fn unary(
        &mut self,
        request: ResiliencyRequest,
        timeout: Option<Duration>,
    ) -> Result<ResiliencyResponse, CallError> {
        let (response, _) = self.unary_call(request, timeout, None).await?;
        Ok(response)
    }

    /// Unary gated by a shared circuit breaker: while the breaker is open the
    /// transport is never touched and the caller gets `BreakerOpen` back.
    pub async fn unary_with_breaker(
        &mut self,
        breaker: &CircuitBreaker,
        request: ResiliencyRequest,
        timeout: Option<Duration>,
    ) -> Result<ResiliencyResponse, CallError> {
        breaker.call(|| self.unary(request, timeout)).await
    }

    pub async fn unary_with_metadata(
        &mut self,
        request: ResiliencyRequest,
        timeout: Option<Duration>,
    ) -> Result<Exchange<ResiliencyResponse>, CallError> {
        let (response, inbound) = self
            .unary_call(request, timeout, Some(metadata::outgoing()))
            .await?;
        metadata::log_inbound(&inbound);

        Ok(Exchange {
            value: response,
            metadata: inbound,
        })
    }

    /// One request, a lazy sequence of responses until end-of-stream or the
    /// first error.
    pub async fn server_streaming(
        &mut self,
        request: ResiliencyRequest,
        timeout: Option<Duration>,
    ) -> Result<CallStream, CallError> {
        let (session, _) = self.server_streaming_call(request, timeout, None).await?;
        Ok(session)
    }

    pub async fn server_streaming_with_metadata(
        &mut self,
        request: ResiliencyRequest,
        timeout: Option<Duration>,
    ) -> Result<Exchange<CallStream>, CallError> {
        let (session, inbound) = self
            .server_streaming_call(request, timeout, Some(metadata::outgoing()))
            .await?;
        metadata::log_inbound(&inbound);

        Ok(Exchange {
            value: session,
            metadata: inbound,
        })
    }

    /// Send every request in order, half-close, then wait for the single
    /// aggregated response. An empty sequence is legal and still waits for
    /// the response the transport defines.
    pub async fn client_streaming(
        &mut self,
        requests: Vec<ResiliencyRequest>,
        timeout: Option<Duration>,
    ) -> Result<ResiliencyResponse, CallError> {
        let (response, _) = self.client_streaming_call(requests, timeout, None).await?;
        Ok(response)
    }

    pub async fn client_streaming_with_metadata(
        &mut self,
        requests: Vec<ResiliencyRequest>,
        timeout: Option<Duration>,
    ) -> Result<Exchange<ResiliencyResponse>, CallError> {
        let (response, inbound) = self
            .client_streaming_call(requests, timeout, Some(metadata::outgoing()))
            .await?;
        metadata::log_inbound(&inbound);

        Ok(Exchange {
            value: response,
            metadata: inbound,
        })
    }

    /// Send and receive concurrently over one session. The returned stream
    /// completes only after both directions have finished; a send-side
    /// failure is yielded even when receiving already ended cleanly.
    pub async fn bidirectional(
        &mut self,
        requests: Vec<ResiliencyRequest>,
        timeout: Option<Duration>,
    ) -> Result<CallStream, CallError> {
        let (session, _) = self.bidirectional_call(requests, timeout, None).await?;
        Ok(session)
    }

    pub async fn bidirectional_with_metadata(
        &mut self,
        requests: Vec<ResiliencyRequest>,
        timeout: Option<Duration>,
    ) -> Result<Exchange<CallStream>, CallError> {
        let (session, inbound) = self
            .bidirectional_call(requests, timeout, Some(metadata::outgoing()))
            .await?;
        metadata::log_inbound(&inbound);

        Ok(Exchange {
            value: session,
            metadata: inbound,
        })
    }

    async fn unary_call(
        &mut self,
        request: ResiliencyRequest,
        timeout: Option<Duration>,
        outgoing: Option<MetadataMap>,
    ) -> Result<(ResiliencyResponse, BTreeMap<String, String>), CallError> {
        let deadline = Deadline::after(timeout);
        let request = prepare(request, &deadline, outgoing);

        let response = deadline
            .bound(self.port.unary(request))
            .await
            .map_err(warn_err("unary"))?;

        let inbound = metadata::inbound(response.metadata());
        Ok((response.into_inner(), inbound))
    }

    async fn server_streaming_call(
        &mut self,
        request: ResiliencyRequest,
        timeout: Option<Duration>,
        outgoing: Option<MetadataMap>,
    ) -> Result<(CallStream, BTreeMap<String, String>), CallError> {
        let deadline = Deadline::after(timeout);
        let request = prepare(request, &deadline, outgoing);

        let response = deadline
            .bound(self.port.server_streaming(request))
            .await
            .map_err(warn_err("server-streaming"))?;

        let inbound = metadata::inbound(response.metadata());
        Ok((bound_session(deadline, response.into_inner()), inbound))
    }

    async fn client_streaming_call(
        &mut self,
        requests: Vec<ResiliencyRequest>,
        timeout: Option<Duration>,
        outgoing: Option<MetadataMap>,
    ) -> Result<(ResiliencyResponse, BTreeMap<String, String>), CallError> {
        let deadline = Deadline::after(timeout);
        let outbound: RequestStream = Box::pin(tokio_stream::iter(requests));
        let request = prepare(outbound, &deadline, outgoing);

        let response = deadline
            .bound(self.port.client_streaming(request))
            .await
            .map_err(warn_err("client-streaming"))?;

        let inbound = metadata::inbound(response.metadata());
        Ok((response.into_inner(), inbound))
    }

    async fn bidirectional_call(
        &mut self,
        requests: Vec<ResiliencyRequest>,
        timeout: Option<Duration>,
        outgoing: Option<MetadataMap>,
    ) -> Result<(CallStream, BTreeMap<String, String>), CallError> {
        let deadline = Deadline::after(timeout);
        let (tx, rx) = mpsc::channel(16);
        let outbound: RequestStream = Box::pin(ReceiverStream::new(rx));
        let request = prepare(outbound, &deadline, outgoing);

        let response = deadline
            .bound(self.port.bidirectional(request))
            .await
            .map_err(warn_err("bidirectional"))?;

        let inbound_metadata = metadata::inbound(response.metadata());
        let mut inbound = response.into_inner();

        let token = CancellationToken::new();
        let send_token = token.clone();

        // Send side runs to completion independently of receiving; dropping
        // tx at the end is the end-of-send signal.
        let sender = tokio::spawn(async move {
            for request in requests {
                tokio::select! {
                    _ = send_token.cancelled() => return Err(CallError::StreamClosed),
                    sent = tx.send(request) => {
                        if sent.is_err() {
                            // Transport dropped the outbound side.
                            return Err(CallError::StreamClosed);
                        }
                    }
                }
            }

            Ok(())
        });

        let session = Box::pin(stream! {
            let mut session_err: Option<CallError> = None;

            loop {
                let item = match deadline.bound_value(inbound.next()).await {
                    Ok(item) => item,
                    Err(expired) => {
                        session_err = Some(expired);
                        break;
                    }
                };

                match item {
                    Some(Ok(response)) => yield Ok(response),
                    Some(Err(status)) => {
                        session_err = Some(CallError::from(status));
                        break;
                    }
                    None => break,
                }
            }

            if session_err.is_some() {
                // The session is dead; make any blocked send fail fast.
                token.cancel();
            }

            // Single join point: the call is complete only once the send
            // side has also finished or failed.
            match sender.await {
                Ok(Ok(())) => {}
                Ok(Err(send_err)) => {
                    if session_err.is_none() {
                        session_err = Some(send_err);
                    }
                }
                Err(_) => {
                    if session_err.is_none() {
                        session_err = Some(CallError::StreamClosed);
                    }
                }
            }

            if let Some(err) = session_err {
                tracing::warn!(error = %err, "bidirectional session ended with error");
                yield Err(err);
            }
        });

        Ok((session, inbound_metadata))
    }
}
