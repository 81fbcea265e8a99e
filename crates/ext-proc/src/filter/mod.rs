//! HTTP filter abstraction over the ext_proc phase machine.
//!
//! A [`HttpFilterFactory`] is built once at startup; every gRPC stream gets
//! its own [`HttpFilter`] instance from it. Filters are driven strictly in
//! message-arrival order by the server, so their methods take `&mut self`
//! and need no internal synchronisation.

pub mod decision;
pub mod opa;
pub mod server;

use envoy_types::pb::envoy::r#type::v3::{HttpStatus, StatusCode};
use envoy_types::pb::envoy::service::ext_proc::v3::{
    processing_response::Response, ImmediateResponse, ProcessingRequest, ProcessingResponse,
};
use opentelemetry::trace::{Status as SpanStatus, TraceContextExt};
use opentelemetry::Context;
use thiserror::Error;

/// A policy denial; recorded on the active span so the decision is visible
/// as an exception event with the policy-supplied message.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct PolicyDenied(pub String);

/// Per-stream filter: one method per processing phase.
pub trait HttpFilter: Send {
    fn on_request_headers(&mut self, cx: &Context, req: &ProcessingRequest) -> ProcessingResponse;
    fn on_request_body(&mut self, cx: &Context, req: &ProcessingRequest) -> ProcessingResponse;
    fn on_response_headers(&mut self, cx: &Context, req: &ProcessingRequest)
        -> ProcessingResponse;
    fn on_response_body(&mut self, cx: &Context, req: &ProcessingRequest) -> ProcessingResponse;
}

/// Factory producing a fresh filter per gRPC stream.
pub trait HttpFilterFactory: Send + Sync {
    fn create_filter(&self) -> Box<dyn HttpFilter>;
}

/// Record `err` on the span carried by `cx`: an exception event plus an
/// error status with the same description.
pub fn record_span_error(cx: &Context, err: &dyn std::error::Error) {
    let span = cx.span();
    span.record_error(err);
    span.set_status(SpanStatus::error(err.to_string()));
}

/// Build an immediate response that stops the stream with the given HTTP
/// status and body.
pub fn error_proxy_response(status: StatusCode, body: &str) -> ProcessingResponse {
    immediate_response(status as i32, body)
}

/// Build an immediate response from a raw HTTP status code.
pub fn immediate_response(code: i32, body: &str) -> ProcessingResponse {
    ProcessingResponse {
        response: Some(Response::ImmediateResponse(ImmediateResponse {
            status: Some(HttpStatus { code }),
            body: body.as_bytes().to_vec(),
            ..Default::default()
        })),
        ..Default::default()
    }
}
