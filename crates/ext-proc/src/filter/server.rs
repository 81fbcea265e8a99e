//! Bidirectional-streaming gRPC driver for the external processor.
//!
//! Each `Process` stream gets a fresh filter from the factory and a task
//! that handles messages strictly in arrival order: receive, open a span
//! named after the request variant, dispatch to the filter, send the
//! response. EOF closes the stream cleanly; receive and send failures
//! terminate it with an Unknown status.

use std::pin::Pin;
use std::sync::Arc;

use envoy_types::pb::envoy::r#type::v3::StatusCode;
use envoy_types::pb::envoy::service::ext_proc::v3::{
    external_processor_server::ExternalProcessor, processing_request::Request as RequestVariant,
    ProcessingRequest, ProcessingResponse,
};
use opentelemetry::trace::{TraceContextExt, Tracer};
use opentelemetry::{global, Context};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, Stream};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error};

use crate::filter::{error_proxy_response, HttpFilter, HttpFilterFactory};
use crate::telemetry::TRACER_NAME;

/// gRPC service wrapping a filter factory.
pub struct ExtProcService {
    factory: Arc<dyn HttpFilterFactory>,
}

impl ExtProcService {
    pub fn new(factory: Arc<dyn HttpFilterFactory>) -> Self {
        Self { factory }
    }
}

#[tonic::async_trait]
impl ExternalProcessor for ExtProcService {
    type ProcessStream =
        Pin<Box<dyn Stream<Item = Result<ProcessingResponse, Status>> + Send + 'static>>;

    async fn process(
        &self,
        request: Request<Streaming<ProcessingRequest>>,
    ) -> Result<Response<Self::ProcessStream>, Status> {
        // One filter instance per proxied request stream.
        let mut filter = self.factory.create_filter();
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(req)) => {
                        let resp = handle_proxy_request(filter.as_mut(), &req);
                        if tx.send(Ok(resp)).await.is_err() {
                            // Receiver dropped: the client went away.
                            debug!("response stream closed by peer");
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("stream closed");
                        break;
                    }
                    Err(e) => {
                        error!(err = %e, "receive error on processing stream");
                        let status =
                            Status::unknown(format!("cannot receive stream request: {e}"));
                        let _ = tx.send(Err(status)).await;
                        break;
                    }
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

/// Dispatch one processing request to the filter under a span named after
/// the request variant.
fn handle_proxy_request(
    filter: &mut dyn HttpFilter,
    req: &ProcessingRequest,
) -> ProcessingResponse {
    let tracer = global::tracer(TRACER_NAME);
    let span = tracer.start(variant_name(req));
    let cx = Context::current_with_span(span);

    let resp = match &req.request {
        Some(RequestVariant::RequestHeaders(_)) => filter.on_request_headers(&cx, req),
        Some(RequestVariant::RequestBody(_)) => filter.on_request_body(&cx, req),
        Some(RequestVariant::ResponseHeaders(_)) => filter.on_response_headers(&cx, req),
        Some(RequestVariant::ResponseBody(_)) => filter.on_response_body(&cx, req),
        other => error_proxy_response(
            StatusCode::BadRequest,
            &format!("unexpected processing request type {other:?}"),
        ),
    };
    cx.span().end();
    resp
}

fn variant_name(req: &ProcessingRequest) -> &'static str {
    match &req.request {
        Some(RequestVariant::RequestHeaders(_)) => "RequestHeaders",
        Some(RequestVariant::RequestBody(_)) => "RequestBody",
        Some(RequestVariant::ResponseHeaders(_)) => "ResponseHeaders",
        Some(RequestVariant::ResponseBody(_)) => "ResponseBody",
        Some(RequestVariant::RequestTrailers(_)) => "RequestTrailers",
        Some(RequestVariant::ResponseTrailers(_)) => "ResponseTrailers",
        None => "Unknown",
    }
}
