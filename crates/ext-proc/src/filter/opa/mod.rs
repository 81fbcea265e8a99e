//! Policy-as-code filter: factory and per-stream phase machine.
//!
//! The factory resolves exactly one policy source — a directory of `.rego`
//! files, a downloaded OCI bundle, inline modules, or a synthesized
//! allow-all module — prepares the evaluator once, and detects the TEE
//! attestation type. Each gRPC stream then gets its own [`OpaFilter`]
//! carrying the accumulated context and the last decision.

pub mod bundle;
pub mod evaluator;

use std::collections::HashMap;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use envoy_types::pb::envoy::config::core::v3::{HeaderValue, HeaderValueOption};
use envoy_types::pb::envoy::r#type::v3::StatusCode;
use envoy_types::pb::envoy::service::ext_proc::v3::{
    body_mutation, common_response, processing_request::Request, processing_response::Response,
    BodyMutation, BodyResponse, CommonResponse, HeaderMutation, HeadersResponse, HttpBody,
    HttpHeaders, ProcessingRequest, ProcessingResponse,
};
use opentelemetry::trace::{TraceContextExt, Tracer};
use opentelemetry::{global, Context, KeyValue};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::PolicyEngineSettings;
use crate::error::ConfigError;
use crate::filter::decision::{Decision, PolicyEvaluator, Rule};
use crate::filter::{
    error_proxy_response, immediate_response, record_span_error, HttpFilter, HttpFilterFactory,
    PolicyDenied,
};
use crate::telemetry::TRACER_NAME;
use evaluator::RegoEvaluator;

/// TEE type asserted on confidential hardware.
pub const TEE_TYPE_SEV_SNP: &str = "sevsnpvm";
/// TEE type asserted outside an enclave.
pub const TEE_TYPE_NONE: &str = "none";
/// Environment variable that disables TEE attestation claims.
pub const ENV_INSECURE_VIRTUAL_ENVIRONMENT: &str = "INSECURE_VIRTUAL_ENVIRONMENT";

const ALLOW_ALL_MODULE: &str = r#"
package ccr.policy

import future.keywords

default on_request_headers = true
default on_request_body = true
default on_response_headers = true
default on_response_body = true
"#;

/// Factory holding the prepared evaluator shared by all streams.
pub struct OpaFilterFactory {
    evaluator: Arc<dyn PolicyEvaluator>,
    tee_type: String,
}

impl std::fmt::Debug for OpaFilterFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpaFilterFactory")
            .field("tee_type", &self.tee_type)
            .finish()
    }
}

impl OpaFilterFactory {
    /// Resolve the policy source, prepare the evaluator, and detect the
    /// TEE type.
    ///
    /// A bundle download runs under a `downloadOpaPolicyBundle` span that is
    /// a child of `cx`; failures are recorded on it as exception events.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when no policy source is configured, a
    /// source cannot be read or downloaded, or a module fails to compile.
    pub async fn new(cx: &Context, settings: &PolicyEngineSettings) -> Result<Self, ConfigError> {
        let modules: HashMap<String, String> = if !settings.policies_directory.is_empty() {
            read_policies_dir(&settings.policies_directory)?
        } else if !settings.bundle_resource.is_empty() {
            let tracer = global::tracer(TRACER_NAME);
            let span = tracer.start_with_context("downloadOpaPolicyBundle", cx);
            let bundle_cx = cx.with_span(span);
            match bundle::download_policy_bundle(settings).await {
                Ok(modules) => {
                    bundle_cx.span().end();
                    modules
                }
                Err(e) => {
                    record_span_error(&bundle_cx, &e);
                    bundle_cx.span().end();
                    return Err(e);
                }
            }
        } else if let Some(modules) = &settings.modules {
            modules.clone()
        } else if settings.allow_all {
            HashMap::from([("allow-all.rego".to_owned(), ALLOW_ALL_MODULE.to_owned())])
        } else {
            return Err(ConfigError::Invalid(
                "a policy source must be specified: policies directory, bundle resource, \
                 inline modules or allow-all"
                    .into(),
            ));
        };

        let evaluator = Arc::new(RegoEvaluator::new(&modules, settings.data.as_ref())?);
        let tee_type = detect_tee_type().to_owned();
        info!(tee_type, modules = modules.len(), "policy filter factory ready");
        Ok(Self {
            evaluator,
            tee_type,
        })
    }

    /// Detected TEE attestation type (`sevsnpvm` or `none`).
    pub fn tee_type(&self) -> &str {
        &self.tee_type
    }
}

impl HttpFilterFactory for OpaFilterFactory {
    fn create_filter(&self) -> Box<dyn HttpFilter> {
        Box::new(OpaFilter::new(
            Arc::clone(&self.evaluator),
            self.tee_type.clone(),
        ))
    }
}

fn read_policies_dir(dir: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut modules = HashMap::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() || path.extension().and_then(|e| e.to_str()) != Some("rego") {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        modules.insert(name, std::fs::read_to_string(&path)?);
    }
    Ok(modules)
}

fn detect_tee_type() -> &'static str {
    let insecure = std::env::var(ENV_INSECURE_VIRTUAL_ENVIRONMENT)
        .map(|v| v == "true")
        .unwrap_or(false);
    if insecure {
        TEE_TYPE_NONE
    } else {
        TEE_TYPE_SEV_SNP
    }
}

#[derive(Clone, Copy)]
enum Phase {
    RequestHeaders,
    RequestBody,
    ResponseHeaders,
    ResponseBody,
}

/// Per-stream policy filter.
pub struct OpaFilter {
    evaluator: Arc<dyn PolicyEvaluator>,
    tee_type: String,
    /// Context entries accumulated from decisions across phases.
    context: serde_json::Map<String, Value>,
    /// Direction tag from the `x-ccr-request-direction` request header.
    request_direction: Option<String>,
    /// Set once a phase denies; later phases replay it without evaluating.
    denied: Option<(u16, String)>,
}

impl OpaFilter {
    pub fn new(evaluator: Arc<dyn PolicyEvaluator>, tee_type: String) -> Self {
        Self {
            evaluator,
            tee_type,
            context: serde_json::Map::new(),
            request_direction: None,
            denied: None,
        }
    }

    /// Direction of the proxied request, once request headers were seen.
    pub fn request_direction(&self) -> Option<&str> {
        self.request_direction.as_deref()
    }

    fn run_phase(
        &mut self,
        cx: &Context,
        rule: Rule,
        payload: Value,
        phase: Phase,
    ) -> ProcessingResponse {
        if let Some((status, body)) = &self.denied {
            return immediate_response(*status as i32, body);
        }

        let mut input = match payload {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        input.insert("context".into(), Value::Object(self.context.clone()));
        input.insert("teeType".into(), Value::String(self.tee_type.clone()));

        let decision = match self.evaluator.eval(rule, &Value::Object(input)) {
            Ok(decision) => decision,
            Err(e) => {
                record_span_error(cx, &e);
                let body = e.to_string();
                self.denied = Some((StatusCode::InternalServerError as u16, body.clone()));
                return immediate_response(StatusCode::InternalServerError as i32, &body);
            }
        };

        if !decision.allowed {
            let status = decision.http_status.unwrap_or(StatusCode::Forbidden as u16);
            let body = decision.body.clone().unwrap_or_default();
            record_span_error(cx, &PolicyDenied(body.clone()));
            self.denied = Some((status, body.clone()));
            return immediate_response(status as i32, &body);
        }

        if let Some(extra) = &decision.context {
            for (key, value) in extra {
                self.context.insert(key.clone(), value.clone());
            }
        }
        allow_response(phase, &decision)
    }
}

impl HttpFilter for OpaFilter {
    fn on_request_headers(&mut self, cx: &Context, req: &ProcessingRequest) -> ProcessingResponse {
        let Some(Request::RequestHeaders(headers)) = &req.request else {
            return error_proxy_response(StatusCode::BadRequest, "expected request headers");
        };
        debug!("handling request headers");

        if let Some(path) = header_text(headers, ":path") {
            cx.span().set_attribute(KeyValue::new("request.path", path));
        }
        if let Some(method) = header_text(headers, ":method") {
            cx.span().set_attribute(KeyValue::new("request.method", method));
        }
        self.request_direction = header_text(headers, "x-ccr-request-direction");

        let payload = json!({ "requestHeaders": headers_to_json(headers) });
        self.run_phase(cx, Rule::OnRequestHeaders, payload, Phase::RequestHeaders)
    }

    fn on_request_body(&mut self, cx: &Context, req: &ProcessingRequest) -> ProcessingResponse {
        let Some(Request::RequestBody(body)) = &req.request else {
            return error_proxy_response(StatusCode::BadRequest, "expected request body");
        };
        let payload = json!({ "requestBody": body_to_json(body) });
        self.run_phase(cx, Rule::OnRequestBody, payload, Phase::RequestBody)
    }

    fn on_response_headers(&mut self, cx: &Context, req: &ProcessingRequest) -> ProcessingResponse {
        let Some(Request::ResponseHeaders(headers)) = &req.request else {
            return error_proxy_response(StatusCode::BadRequest, "expected response headers");
        };
        debug!("handling response headers");
        let payload = json!({ "responseHeaders": headers_to_json(headers) });
        self.run_phase(cx, Rule::OnResponseHeaders, payload, Phase::ResponseHeaders)
    }

    fn on_response_body(&mut self, cx: &Context, req: &ProcessingRequest) -> ProcessingResponse {
        let Some(Request::ResponseBody(body)) = &req.request else {
            return error_proxy_response(StatusCode::BadRequest, "expected response body");
        };
        let payload = json!({ "responseBody": body_to_json(body) });
        self.run_phase(cx, Rule::OnResponseBody, payload, Phase::ResponseBody)
    }
}

fn allow_response(phase: Phase, decision: &Decision) -> ProcessingResponse {
    let mut common = CommonResponse {
        status: common_response::ResponseStatus::Continue as i32,
        ..Default::default()
    };

    let mut set_headers: Vec<HeaderValueOption> = Vec::new();
    if matches!(phase, Phase::RequestBody | Phase::ResponseBody) {
        if let Some(body) = &decision.body {
            common.body_mutation = Some(BodyMutation {
                mutation: Some(body_mutation::Mutation::Body(body.clone().into_bytes())),
            });
            set_headers.push(header_option("Content-Length", &body.len().to_string()));
        }
    }
    if let Some(headers) = &decision.headers {
        for (key, value) in headers {
            set_headers.push(header_option(key, value));
        }
    }
    if !set_headers.is_empty() {
        common.header_mutation = Some(HeaderMutation {
            set_headers,
            ..Default::default()
        });
    }

    let response = match phase {
        Phase::RequestHeaders => Response::RequestHeaders(HeadersResponse {
            response: Some(common),
        }),
        Phase::RequestBody => Response::RequestBody(BodyResponse {
            response: Some(common),
        }),
        Phase::ResponseHeaders => Response::ResponseHeaders(HeadersResponse {
            response: Some(common),
        }),
        Phase::ResponseBody => Response::ResponseBody(BodyResponse {
            response: Some(common),
        }),
    };
    ProcessingResponse {
        response: Some(response),
        ..Default::default()
    }
}

fn header_option(key: &str, value: &str) -> HeaderValueOption {
    HeaderValueOption {
        header: Some(HeaderValue {
            key: key.to_owned(),
            value: value.to_owned(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn header_text(headers: &HttpHeaders, name: &str) -> Option<String> {
    headers
        .headers
        .as_ref()?
        .headers
        .iter()
        .find(|h| h.key == name)
        .map(|h| {
            if h.raw_value.is_empty() {
                h.value.clone()
            } else {
                String::from_utf8_lossy(&h.raw_value).into_owned()
            }
        })
}

/// Render headers the way protojson does: `raw_value` bytes as base64 under
/// `rawValue`, so policies can match on them directly.
fn headers_to_json(headers: &HttpHeaders) -> Value {
    let entries: Vec<Value> = headers
        .headers
        .as_ref()
        .map(|map| {
            map.headers
                .iter()
                .map(|h| {
                    json!({
                        "key": h.key,
                        "value": h.value,
                        "rawValue": STANDARD.encode(&h.raw_value),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    json!({ "headers": { "headers": entries }, "endOfStream": headers.end_of_stream })
}

fn body_to_json(body: &HttpBody) -> Value {
    json!({ "body": STANDARD.encode(&body.body), "endOfStream": body.end_of_stream })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::decision::EvalError;
    use envoy_types::pb::envoy::config::core::v3::HeaderMap;
    use envoy_types::pb::envoy::service::ext_proc::v3::ImmediateResponse;
    use opentelemetry_sdk::testing::trace::InMemorySpanExporter;
    use opentelemetry_sdk::trace::TracerProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    // Serialises tests that touch the global tracer provider or env vars.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    const TEST_MODULE: &str = r#"
        package ccr.policy

        import future.keywords

        default on_request_headers = {
            "allowed": false,
            "http_status": 403,
            "body": "RequestNotAllowed"
        }

        on_request_headers := response if {
            is_inbound_request == true
            some h1 in input.requestHeaders.headers.headers
            h1.key == ":path"
            h1.rawValue == base64.encode("/api/action1")

            some h2 in input.requestHeaders.headers.headers
            h2.key == ":method"
            h2.rawValue == base64.encode("GET")
            response := {
                "allowed": true,
                "context": {
                    "path": "/api/action1"
                }
            }
        }

        is_inbound_request := true if {
            some header in input.requestHeaders.headers.headers
            header.key == "x-ccr-request-direction"
            base64.decode(header.rawValue) == "inbound"
        } else := false

        default on_request_body = false

        on_request_body := response if {
            input.context.path == "/api/action1"
            input.requestBody.body == "aW5wdXQgYm9keQ=="
            response := {
                "allowed": true,
                "body": "output body"
            }
        }

        default on_response_headers = true

        default on_response_body = true

        on_response_body := response if {
            input.context.path == "/api/action1"
            input.responseBody.body == "aW5wdXQgYm9keQ=="
            response := {
                "allowed": true,
                "body": "output body"
            }
        }
    "#;

    fn lock() -> std::sync::MutexGuard<'static, ()> {
        TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn install_test_tracing() -> InMemorySpanExporter {
        let exporter = InMemorySpanExporter::default();
        let provider = TracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        global::set_tracer_provider(provider);
        exporter
    }

    async fn test_filter() -> Box<dyn HttpFilter> {
        let settings = PolicyEngineSettings {
            modules: Some(HashMap::from([(
                "example.rego".to_owned(),
                TEST_MODULE.to_owned(),
            )])),
            ..Default::default()
        };
        let factory = OpaFilterFactory::new(&Context::current(), &settings)
            .await
            .unwrap();
        factory.create_filter()
    }

    fn raw_header(key: &str, value: &str) -> HeaderValue {
        HeaderValue {
            key: key.to_owned(),
            raw_value: value.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    fn headers_request(path: &str, method: &str, direction: &str) -> ProcessingRequest {
        ProcessingRequest {
            request: Some(Request::RequestHeaders(HttpHeaders {
                headers: Some(HeaderMap {
                    headers: vec![
                        raw_header(":path", path),
                        raw_header(":method", method),
                        raw_header("x-ccr-request-direction", direction),
                    ],
                    ..Default::default()
                }),
                end_of_stream: true,
                ..Default::default()
            })),
            ..Default::default()
        }
    }

    fn request_body(contents: &[u8]) -> ProcessingRequest {
        ProcessingRequest {
            request: Some(Request::RequestBody(HttpBody {
                body: contents.to_vec(),
                end_of_stream: true,
                ..Default::default()
            })),
            ..Default::default()
        }
    }

    fn response_body(contents: &[u8]) -> ProcessingRequest {
        ProcessingRequest {
            request: Some(Request::ResponseBody(HttpBody {
                body: contents.to_vec(),
                end_of_stream: true,
                ..Default::default()
            })),
            ..Default::default()
        }
    }

    fn expect_immediate(resp: &ProcessingResponse) -> &ImmediateResponse {
        match &resp.response {
            Some(Response::ImmediateResponse(ir)) => ir,
            other => panic!("expected immediate response, got {other:?}"),
        }
    }

    fn expect_continue_common(resp: &ProcessingResponse) -> &CommonResponse {
        let common = match &resp.response {
            Some(Response::RequestHeaders(hr)) => hr.response.as_ref(),
            Some(Response::ResponseHeaders(hr)) => hr.response.as_ref(),
            Some(Response::RequestBody(br)) => br.response.as_ref(),
            Some(Response::ResponseBody(br)) => br.response.as_ref(),
            other => panic!("expected a phase response, got {other:?}"),
        }
        .expect("phase response missing common response");
        assert_eq!(
            common.status,
            common_response::ResponseStatus::Continue as i32
        );
        common
    }

    fn assert_body_mutation(common: &CommonResponse, expected: &str) {
        let mutation = common
            .body_mutation
            .as_ref()
            .and_then(|m| m.mutation.as_ref())
            .expect("expected a body mutation");
        let body_mutation::Mutation::Body(bytes) = mutation else {
            panic!("expected a full-body mutation, got {mutation:?}");
        };
        assert_eq!(bytes, expected.as_bytes());

        let set = &common
            .header_mutation
            .as_ref()
            .expect("expected a header mutation")
            .set_headers;
        assert_eq!(set.len(), 1, "exactly one header must be set");
        let header = set[0].header.as_ref().unwrap();
        assert_eq!(header.key, "Content-Length");
        assert_eq!(header.value, expected.len().to_string());
    }

    #[tokio::test]
    async fn request_header_path_allowed_with_span_attributes() {
        let _guard = lock();
        let exporter = install_test_tracing();
        let tracer = global::tracer("test");

        let mut filter = test_filter().await;
        let span = tracer.start("testspan");
        let cx = Context::current_with_span(span);
        let resp = filter.on_request_headers(&cx, &headers_request("/api/action1", "GET", "inbound"));
        expect_continue_common(&resp);
        cx.span().end();

        let spans = exporter.get_finished_spans().unwrap();
        let span = spans
            .iter()
            .find(|s| s.name == "testspan")
            .expect("testspan not exported");
        let mut found_path = false;
        let mut found_method = false;
        for attr in &span.attributes {
            if attr.key.as_str() == "request.path" && attr.value.as_str() == "/api/action1" {
                found_path = true;
            }
            if attr.key.as_str() == "request.method" && attr.value.as_str() == "GET" {
                found_method = true;
            }
        }
        assert!(found_path, "missing request.path attribute: {:?}", span.attributes);
        assert!(found_method, "missing request.method attribute: {:?}", span.attributes);
    }

    #[tokio::test]
    async fn request_header_path_disallowed_records_exception() {
        let _guard = lock();
        let exporter = install_test_tracing();
        let tracer = global::tracer("test");

        let mut filter = test_filter().await;
        let span = tracer.start("testspan");
        let cx = Context::current_with_span(span);
        let resp = filter.on_request_headers(&cx, &headers_request("/api/action2", "GET", "inbound"));
        let ir = expect_immediate(&resp);
        assert_eq!(ir.status.as_ref().unwrap().code, StatusCode::Forbidden as i32);
        assert_eq!(ir.body, b"RequestNotAllowed");
        cx.span().end();

        let spans = exporter.get_finished_spans().unwrap();
        let span = spans.iter().find(|s| s.name == "testspan").unwrap();
        let exception = span
            .events
            .events
            .iter()
            .find(|e| e.name == "exception")
            .expect("missing exception event");
        assert!(
            exception.attributes.iter().any(|a| {
                a.key.as_str() == "exception.message" && a.value.as_str() == "RequestNotAllowed"
            }),
            "missing exception.message attribute: {:?}",
            exception.attributes
        );
        assert!(matches!(
            &span.status,
            opentelemetry::trace::Status::Error { description } if description.as_ref() == "RequestNotAllowed"
        ));
    }

    #[tokio::test]
    async fn request_header_outbound_direction_disallowed() {
        let mut filter = test_filter().await;
        let resp = filter.on_request_headers(
            &Context::current(),
            &headers_request("/api/action1", "GET", "outbound"),
        );
        let ir = expect_immediate(&resp);
        assert_eq!(ir.status.as_ref().unwrap().code, StatusCode::Forbidden as i32);
    }

    #[tokio::test]
    async fn request_header_method_disallowed() {
        let mut filter = test_filter().await;
        let resp = filter.on_request_headers(
            &Context::current(),
            &headers_request("/api/action1", "POST", "inbound"),
        );
        let ir = expect_immediate(&resp);
        assert_eq!(ir.status.as_ref().unwrap().code, StatusCode::Forbidden as i32);
    }

    #[tokio::test]
    async fn request_body_mutation_sets_content_length() {
        let mut filter = test_filter().await;
        let cx = Context::current();

        let resp = filter.on_request_headers(&cx, &headers_request("/api/action1", "GET", "inbound"));
        expect_continue_common(&resp);

        let resp = filter.on_request_body(&cx, &request_body(b"input body"));
        let common = expect_continue_common(&resp);
        assert_body_mutation(common, "output body");
    }

    #[tokio::test]
    async fn response_body_mutation_sets_content_length() {
        let mut filter = test_filter().await;
        let cx = Context::current();

        let resp = filter.on_request_headers(&cx, &headers_request("/api/action1", "GET", "inbound"));
        expect_continue_common(&resp);

        let resp = filter.on_response_body(&cx, &response_body(b"input body"));
        let common = expect_continue_common(&resp);
        assert_body_mutation(common, "output body");
    }

    #[tokio::test]
    async fn context_is_required_by_body_phase() {
        // Without the request-headers phase the context entry is absent and
        // the body rule falls back to its deny default.
        let mut filter = test_filter().await;
        let resp = filter.on_request_body(&Context::current(), &request_body(b"input body"));
        let ir = expect_immediate(&resp);
        assert_eq!(ir.status.as_ref().unwrap().code, StatusCode::Forbidden as i32);
    }

    struct CountingEvaluator {
        calls: AtomicUsize,
    }

    impl PolicyEvaluator for CountingEvaluator {
        fn eval(&self, _rule: Rule, _input: &Value) -> Result<Decision, EvalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Decision {
                allowed: false,
                http_status: Some(403),
                body: Some("RequestNotAllowed".into()),
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn denied_stream_short_circuits_later_phases() {
        let evaluator = Arc::new(CountingEvaluator {
            calls: AtomicUsize::new(0),
        });
        let mut filter = OpaFilter::new(evaluator.clone(), TEE_TYPE_NONE.to_owned());
        let cx = Context::current();

        let resp = filter.on_request_headers(&cx, &headers_request("/x", "GET", "inbound"));
        let ir = expect_immediate(&resp);
        assert_eq!(ir.status.as_ref().unwrap().code, 403);

        // Later phases replay the immediate response without evaluating.
        let resp = filter.on_request_body(&cx, &request_body(b"input body"));
        let ir = expect_immediate(&resp);
        assert_eq!(ir.status.as_ref().unwrap().code, 403);
        assert_eq!(ir.body, b"RequestNotAllowed");

        let response_headers = ProcessingRequest {
            request: Some(Request::ResponseHeaders(HttpHeaders::default())),
            ..Default::default()
        };
        let resp = filter.on_response_headers(&cx, &response_headers);
        let ir = expect_immediate(&resp);
        assert_eq!(ir.status.as_ref().unwrap().code, 403);

        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 1);
    }

    struct FailingEvaluator;

    impl PolicyEvaluator for FailingEvaluator {
        fn eval(&self, _rule: Rule, _input: &Value) -> Result<Decision, EvalError> {
            Err(EvalError("engine exploded".into()))
        }
    }

    #[tokio::test]
    async fn evaluator_failure_is_a_500_immediate_response() {
        let mut filter = OpaFilter::new(Arc::new(FailingEvaluator), TEE_TYPE_NONE.to_owned());
        let resp = filter.on_request_headers(
            &Context::current(),
            &headers_request("/x", "GET", "inbound"),
        );
        let ir = expect_immediate(&resp);
        assert_eq!(
            ir.status.as_ref().unwrap().code,
            StatusCode::InternalServerError as i32
        );
    }

    #[tokio::test]
    async fn request_direction_is_recorded() {
        let settings = PolicyEngineSettings {
            allow_all: true,
            ..Default::default()
        };
        let factory = OpaFilterFactory::new(&Context::current(), &settings)
            .await
            .unwrap();
        let mut filter = OpaFilter::new(
            Arc::clone(&factory.evaluator),
            factory.tee_type().to_owned(),
        );
        filter.on_request_headers(
            &Context::current(),
            &headers_request("/x", "GET", "outbound"),
        );
        assert_eq!(filter.request_direction(), Some("outbound"));
    }

    #[tokio::test]
    async fn allow_all_factory_permits_every_phase() {
        let settings = PolicyEngineSettings {
            allow_all: true,
            ..Default::default()
        };
        let factory = OpaFilterFactory::new(&Context::current(), &settings)
            .await
            .unwrap();
        let mut filter = factory.create_filter();
        let cx = Context::current();

        expect_continue_common(
            &filter.on_request_headers(&cx, &headers_request("/any", "DELETE", "outbound")),
        );
        expect_continue_common(&filter.on_request_body(&cx, &request_body(b"anything")));
        let response_headers = ProcessingRequest {
            request: Some(Request::ResponseHeaders(HttpHeaders::default())),
            ..Default::default()
        };
        expect_continue_common(&filter.on_response_headers(&cx, &response_headers));
        expect_continue_common(&filter.on_response_body(&cx, &response_body(b"anything")));
    }

    #[tokio::test]
    async fn directory_source_reads_only_rego_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("example.rego"), TEST_MODULE).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a policy").unwrap();
        std::fs::create_dir(dir.path().join("sub.rego")).unwrap();

        let settings = PolicyEngineSettings {
            policies_directory: dir.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        let factory = OpaFilterFactory::new(&Context::current(), &settings)
            .await
            .unwrap();
        let mut filter = factory.create_filter();
        let resp = filter.on_request_headers(
            &Context::current(),
            &headers_request("/api/action1", "GET", "inbound"),
        );
        expect_continue_common(&resp);
    }

    #[tokio::test]
    async fn missing_policy_source_is_a_config_error() {
        let err = OpaFilterFactory::new(&Context::current(), &PolicyEngineSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("policy source"));
    }

    #[tokio::test]
    async fn tee_type_follows_insecure_environment_toggle() {
        let _guard = lock();
        let settings = PolicyEngineSettings {
            allow_all: true,
            ..Default::default()
        };

        std::env::set_var(ENV_INSECURE_VIRTUAL_ENVIRONMENT, "true");
        let factory = OpaFilterFactory::new(&Context::current(), &settings)
            .await
            .unwrap();
        assert_eq!(factory.tee_type(), TEE_TYPE_NONE);

        std::env::remove_var(ENV_INSECURE_VIRTUAL_ENVIRONMENT);
        let factory = OpaFilterFactory::new(&Context::current(), &settings)
            .await
            .unwrap();
        assert_eq!(factory.tee_type(), TEE_TYPE_SEV_SNP);
    }

    #[tokio::test]
    async fn bundle_download_failure_records_exception_span() {
        let _guard = lock();
        let exporter = install_test_tracing();
        let tracer = global::tracer("test");
        let span = tracer.start("testspan");
        let cx = Context::current_with_span(span);

        let settings = PolicyEngineSettings {
            bundle_resource: "non-existent-server.com:1234/policy-bundle:latest".into(),
            ..Default::default()
        };
        let err = OpaFilterFactory::new(&cx, &settings).await.unwrap_err();
        assert!(
            err.to_string()
                .contains("failed to pull non-existent-server.com:1234/policy-bundle:latest"),
            "unexpected error: {err}"
        );
        cx.span().end();

        let spans = exporter.get_finished_spans().unwrap();
        let download = spans
            .iter()
            .find(|s| s.name == "downloadOpaPolicyBundle")
            .expect("missing downloadOpaPolicyBundle span");
        let parent = spans.iter().find(|s| s.name == "testspan").unwrap();
        assert_eq!(
            download.parent_span_id,
            parent.span_context.span_id(),
            "download span must be a child of the caller span"
        );
        let exception = download
            .events
            .events
            .iter()
            .find(|e| e.name == "exception")
            .expect("missing exception event");
        assert!(exception.attributes.iter().any(|a| {
            a.key.as_str() == "exception.message"
                && a.value.as_str().contains("failed to pull")
        }));
        assert!(matches!(
            &download.status,
            opentelemetry::trace::Status::Error { description } if description.contains("failed to pull")
        ));
    }
}
