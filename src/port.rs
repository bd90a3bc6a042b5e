use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tonic::transport::Channel;
use tonic::{Request, Response, Status};

use crate::comms::resiliency_service_client::ResiliencyServiceClient;
use crate::comms::{ResiliencyRequest, ResiliencyResponse};

/// Ordered requests fed into a client-streaming or bidirectional session.
pub type RequestStream = Pin<Box<dyn Stream<Item = ResiliencyRequest> + Send + Sync + 'static>>;

/// Responses pulled off a server-streaming or bidirectional session. A
/// `None` from the stream is end-of-stream, a terminal non-error signal.
pub type ResponseStream =
    Pin<Box<dyn Stream<Item = Result<ResiliencyResponse, Status>> + Send + 'static>>;

/// The four call-shape primitives of the remote collaborator.
///
/// Requests are passed as `tonic::Request` so metadata and the grpc-timeout
/// hint ride along with the call. The port never dials or closes the
/// connection; the caller owns that once per process.
#[async_trait]
pub trait ResiliencyPort: Send {
    async fn unary(
        &mut self,
        request: Request<ResiliencyRequest>,
    ) -> Result<Response<ResiliencyResponse>, Status>;

    async fn server_streaming(
        &mut self,
        request: Request<ResiliencyRequest>,
    ) -> Result<Response<ResponseStream>, Status>;

    async fn client_streaming(
        &mut self,
        request: Request<RequestStream>,
    ) -> Result<Response<ResiliencyResponse>, Status>;

    async fn bidirectional(
        &mut self,
        request: Request<RequestStream>,
    ) -> Result<Response<ResponseStream>, Status>;
}

fn box_stream(
    response: Response<tonic::codec::Streaming<ResiliencyResponse>>,
) -> Response<ResponseStream> {
    response.map(|stream| Box::pin(stream) as ResponseStream)
}

#[async_trait]
impl ResiliencyPort for ResiliencyServiceClient<Channel> {
    async fn unary(
        &mut self,
        request: Request<ResiliencyRequest>,
    ) -> Result<Response<ResiliencyResponse>, Status> {
        self.unary_resiliency(request).await
    }

    async fn server_streaming(
        &mut self,
        request: Request<ResiliencyRequest>,
    ) -> Result<Response<ResponseStream>, Status> {
        let response = self.server_streaming_resiliency(request).await?;
        Ok(box_stream(response))
    }

    async fn client_streaming(
        &mut self,
        request: Request<RequestStream>,
    ) -> Result<Response<ResiliencyResponse>, Status> {
        let fut: Pin<
            Box<
                dyn std::future::Future<Output = Result<Response<ResiliencyResponse>, Status>>
                    + Send
                    + '_,
            >,
        > = Box::pin(self.client_streaming_resiliency(request));
        fut.await
    }

    async fn bidirectional(
        &mut self,
        request: Request<RequestStream>,
    ) -> Result<Response<ResponseStream>, Status> {
        let fut: Pin<
            Box<
                dyn std::future::Future<
                        Output = Result<
                            Response<tonic::codec::Streaming<ResiliencyResponse>>,
                            Status,
                        >,
                    > + Send
                    + '_,
            >,
        > = Box::pin(self.bi_directional_resiliency(request));
        let response = fut.await?;
        Ok(box_stream(response))
    }
}
