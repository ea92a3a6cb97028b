//! Tracing bridge: carries trace context across hops.
//!
//! Two operations, mirroring the two directions of a call:
//! - [`start_outbound`] opens a client span for a request about to be
//!   sent, copies its 64-bit ids into the wire tracing field when the
//!   tracer can express them, and injects the span context into the
//!   transport headers under the reserved `$tracing$` prefix.
//! - [`start_inbound`] recovers the parent context from those headers
//!   (falling back to the wire tracing field), strips the tracer-owned
//!   headers from the request, and opens a server span.
//!
//! The tracer and tracing context are optional collaborators; without
//! them both operations are no-ops. Interceptor failures abort the call
//! before any frame is sent.

mod carrier;
mod tracer;

pub use carrier::{strip_tracing_headers, PrefixedHeadersCarrier, TRACING_KEY_PREFIX};
pub use tracer::{
    RequestSpanInterceptor, Span, SpanBuilder, SpanContext, TextMapReader, TextMapWriter,
    TraceError, Tracer, TracingContext, WireSpanContext,
};

use crate::call::CallRequest;
use crate::connection::InboundCall;
use crate::error::{Result, TChannelError};

/// Transport header naming the caller, used to tag server spans.
const CALLER_NAME_HEADER: &str = "cn";

/// Transport header naming the argument scheme.
const ARG_SCHEME_HEADER: &str = "as";

/// Open a client span for an outbound request.
///
/// No-op unless both `tracer` and `context` are present. On success the
/// request's wire tracing field and `$tracing$` headers are populated and
/// the span is returned; the caller finishes it via [`finish_span`] when
/// the call reaches a terminal state.
///
/// # Errors
///
/// Propagates an interceptor failure; the span is already finished and the
/// request must not be sent.
pub fn start_outbound(
    request: &mut CallRequest,
    tracer: Option<&dyn Tracer>,
    context: Option<&dyn TracingContext>,
) -> Result<Option<Box<dyn Span>>> {
    let (tracer, context) = match (tracer, context) {
        (Some(tracer), Some(context)) => (tracer, context),
        _ => return Ok(None),
    };

    let mut builder = tracer.build_span(&request.endpoint());
    if let Some(parent) = context.current() {
        builder.child_of(parent.as_ref());
    }
    builder.tag("span.kind", "client");
    builder.tag("peer.service", &request.service);
    if let Some(scheme) = request.headers.get(ARG_SCHEME_HEADER) {
        builder.tag("as", scheme);
    }
    let mut span = builder.start();

    if let Some(interceptor) = context.interceptor() {
        if let Err(e) = interceptor.intercept_outbound(request, span.as_mut()) {
            span.log_event(&[("event", "error"), ("message", &e.0)]);
            span.finish();
            return Err(TChannelError::Interceptor(e.0));
        }
    }

    if let Some(ids) = span.context().wire_ids() {
        request.tracing = ids;
    }

    let mut headers_carrier = PrefixedHeadersCarrier::new(&mut request.headers);
    if let Err(e) = tracer.inject(span.context(), &mut headers_carrier) {
        tracing::error!("failed to inject span context into headers: {e}");
    }

    Ok(Some(span))
}

/// Open a server span for a reassembled inbound call.
///
/// Clears the context, recovers the parent span context from the call's
/// `$tracing$` headers (or synthesizes one from the wire tracing field),
/// strips the tracer-owned headers so the handler never sees them, starts
/// a server-kind span and pushes its context.
///
/// # Errors
///
/// Propagates an interceptor failure; the span is already finished and the
/// call must not reach the handler.
pub fn start_inbound(
    call: &mut InboundCall,
    tracer: &dyn Tracer,
    context: &dyn TracingContext,
) -> Result<Box<dyn Span>> {
    context.clear();

    let headers_carrier = PrefixedHeadersCarrier::new(&mut call.headers);
    let mut parent = tracer.extract(&headers_carrier);
    strip_tracing_headers(&mut call.headers);

    if parent.is_none() && call.tracing.trace_id != 0 {
        parent = Some(Box::new(WireSpanContext::new(call.tracing)));
    }

    let mut builder = tracer.build_span(&call.endpoint());
    if let Some(parent) = &parent {
        builder.child_of(parent.as_ref());
    }
    builder.tag("span.kind", "server");
    if let Some(scheme) = call.headers.get(ARG_SCHEME_HEADER) {
        builder.tag("as", scheme);
    }
    if let Some(caller) = call.headers.get(CALLER_NAME_HEADER) {
        builder.tag("peer.service", caller);
    }
    let mut span = builder.start();

    if let Some(interceptor) = context.interceptor() {
        if let Err(e) = interceptor.intercept_inbound(call, span.as_mut()) {
            span.log_event(&[("event", "error"), ("message", &e.0)]);
            span.finish();
            return Err(TChannelError::Interceptor(e.0));
        }
    }

    context.push(span.context().clone_boxed());
    Ok(span)
}

/// Finish a span when its call reaches a terminal state.
///
/// `error` tags the span and records the failure message first.
pub fn finish_span(mut span: Box<dyn Span>, error: Option<&str>) {
    if let Some(message) = error {
        span.set_tag("error", "true");
        span.log_event(&[("message", message)]);
    }
    span.finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::InboundCall;
    use crate::protocol::Trace;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, Default)]
    struct TestSpanContext {
        ids: Trace,
    }

    impl SpanContext for TestSpanContext {
        fn wire_ids(&self) -> Option<Trace> {
            Some(self.ids)
        }

        fn clone_boxed(&self) -> Box<dyn SpanContext> {
            Box::new(self.clone())
        }
    }

    #[derive(Default)]
    struct SpanRecord {
        operation: String,
        tags: Vec<(String, String)>,
        logs: Vec<Vec<(String, String)>>,
        finished: bool,
        parent: Option<Trace>,
    }

    struct TestSpan {
        context: TestSpanContext,
        record: Arc<Mutex<SpanRecord>>,
    }

    impl Span for TestSpan {
        fn context(&self) -> &dyn SpanContext {
            &self.context
        }

        fn set_tag(&mut self, key: &str, value: &str) {
            self.record
                .lock()
                .unwrap()
                .tags
                .push((key.to_string(), value.to_string()));
        }

        fn log_event(&mut self, fields: &[(&str, &str)]) {
            self.record.lock().unwrap().logs.push(
                fields
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            );
        }

        fn finish(&mut self) {
            self.record.lock().unwrap().finished = true;
        }
    }

    struct TestSpanBuilder {
        record: Arc<Mutex<SpanRecord>>,
    }

    impl SpanBuilder for TestSpanBuilder {
        fn child_of(&mut self, parent: &dyn SpanContext) {
            self.record.lock().unwrap().parent = parent.wire_ids();
        }

        fn tag(&mut self, key: &str, value: &str) {
            self.record
                .lock()
                .unwrap()
                .tags
                .push((key.to_string(), value.to_string()));
        }

        fn start(self: Box<Self>) -> Box<dyn Span> {
            let parent = self.record.lock().unwrap().parent;
            let trace_id = parent.map(|p| p.trace_id).unwrap_or(77);
            Box::new(TestSpan {
                context: TestSpanContext {
                    ids: Trace {
                        span_id: 100,
                        parent_id: parent.map(|p| p.span_id).unwrap_or(0),
                        trace_id,
                        flags: 1,
                    },
                },
                record: self.record,
            })
        }
    }

    #[derive(Clone, Default)]
    struct TestTracer {
        spans: Arc<Mutex<Vec<Arc<Mutex<SpanRecord>>>>>,
    }

    impl TestTracer {
        fn last_span(&self) -> Arc<Mutex<SpanRecord>> {
            self.spans.lock().unwrap().last().unwrap().clone()
        }
    }

    impl Tracer for TestTracer {
        fn build_span(&self, operation: &str) -> Box<dyn SpanBuilder> {
            let record = Arc::new(Mutex::new(SpanRecord {
                operation: operation.to_string(),
                ..SpanRecord::default()
            }));
            self.spans.lock().unwrap().push(record.clone());
            Box::new(TestSpanBuilder { record })
        }

        fn inject(
            &self,
            context: &dyn SpanContext,
            carrier: &mut dyn TextMapWriter,
        ) -> std::result::Result<(), TraceError> {
            let ids = context.wire_ids().ok_or_else(|| TraceError("no ids".into()))?;
            carrier.put("traceid", &ids.trace_id.to_string());
            carrier.put("spanid", &ids.span_id.to_string());
            Ok(())
        }

        fn extract(&self, carrier: &dyn TextMapReader) -> Option<Box<dyn SpanContext>> {
            let entries: HashMap<String, String> = carrier.entries().into_iter().collect();
            let trace_id = entries.get("traceid")?.parse().ok()?;
            let span_id = entries.get("spanid")?.parse().ok()?;
            Some(Box::new(TestSpanContext {
                ids: Trace {
                    span_id,
                    parent_id: 0,
                    trace_id,
                    flags: 1,
                },
            }))
        }
    }

    #[derive(Default)]
    struct TestContext {
        stack: Mutex<Vec<Box<dyn SpanContext>>>,
        fail_outbound: bool,
    }

    impl TracingContext for TestContext {
        fn current(&self) -> Option<Box<dyn SpanContext>> {
            self.stack.lock().unwrap().last().map(|c| c.clone_boxed())
        }

        fn push(&self, context: Box<dyn SpanContext>) {
            self.stack.lock().unwrap().push(context);
        }

        fn clear(&self) {
            self.stack.lock().unwrap().clear();
        }

        fn interceptor(&self) -> Option<&dyn RequestSpanInterceptor> {
            if self.fail_outbound {
                Some(self)
            } else {
                None
            }
        }
    }

    impl RequestSpanInterceptor for TestContext {
        fn intercept_outbound(
            &self,
            _request: &CallRequest,
            _span: &mut dyn Span,
        ) -> std::result::Result<(), TraceError> {
            Err(TraceError("rejected by policy".into()))
        }

        fn intercept_inbound(
            &self,
            _request: &InboundCall,
            _span: &mut dyn Span,
        ) -> std::result::Result<(), TraceError> {
            Ok(())
        }
    }

    #[test]
    fn test_outbound_noop_without_tracer() {
        let mut request = CallRequest::new("svc", &b"echo"[..]);
        let span = start_outbound(&mut request, None, None).unwrap();
        assert!(span.is_none());
        assert!(request.headers.is_empty());
    }

    #[test]
    fn test_outbound_sets_wire_ids_and_injects_headers() {
        let tracer = TestTracer::default();
        let context = TestContext::default();
        let mut request = CallRequest::new("svc", &b"echo"[..]);

        let span = start_outbound(&mut request, Some(&tracer), Some(&context))
            .unwrap()
            .expect("span");

        assert_eq!(request.tracing.trace_id, 77);
        assert_eq!(request.tracing.span_id, 100);
        assert!(request.headers.contains_key("$tracing$traceid"));
        assert!(request.headers.contains_key("$tracing$spanid"));

        let record = tracer.last_span();
        finish_span(span, None);
        let record = record.lock().unwrap();
        assert_eq!(record.operation, "echo");
        assert!(record
            .tags
            .contains(&("span.kind".to_string(), "client".to_string())));
        assert!(record
            .tags
            .contains(&("peer.service".to_string(), "svc".to_string())));
        assert!(record.finished);
    }

    #[test]
    fn test_outbound_child_of_current_context() {
        let tracer = TestTracer::default();
        let context = TestContext::default();
        context.push(Box::new(TestSpanContext {
            ids: Trace {
                span_id: 9,
                parent_id: 0,
                trace_id: 1234,
                flags: 1,
            },
        }));
        let mut request = CallRequest::new("svc", &b"echo"[..]);

        start_outbound(&mut request, Some(&tracer), Some(&context))
            .unwrap()
            .expect("span");

        // Child span inherits the parent's trace id.
        assert_eq!(request.tracing.trace_id, 1234);
        assert_eq!(request.tracing.parent_id, 9);
    }

    #[test]
    fn test_outbound_interceptor_failure_finishes_span_and_propagates() {
        let tracer = TestTracer::default();
        let context = TestContext {
            fail_outbound: true,
            ..TestContext::default()
        };
        let mut request = CallRequest::new("svc", &b"echo"[..]);

        let err = start_outbound(&mut request, Some(&tracer), Some(&context)).unwrap_err();
        assert!(matches!(err, TChannelError::Interceptor(_)));

        let record = tracer.last_span();
        let record = record.lock().unwrap();
        assert!(record.finished);
        assert!(!record.logs.is_empty());
    }

    #[test]
    fn test_inbound_extracts_parent_and_strips_headers() {
        let tracer = TestTracer::default();
        let context = TestContext::default();
        let mut call = InboundCall::for_testing(
            "svc",
            &b"echo"[..],
            HashMap::from([
                ("cn".to_string(), "caller".to_string()),
                ("$tracing$traceid".to_string(), "4242".to_string()),
                ("$tracing$spanid".to_string(), "17".to_string()),
            ]),
        );

        let span = start_inbound(&mut call, &tracer, &context).unwrap();

        assert!(!call.headers.keys().any(|k| k.starts_with("$tracing$")));
        assert!(call.headers.contains_key("cn"));
        assert_eq!(span.context().wire_ids().unwrap().trace_id, 4242);
        assert!(context.current().is_some());

        let record = tracer.last_span();
        let record = record.lock().unwrap();
        assert!(record
            .tags
            .contains(&("span.kind".to_string(), "server".to_string())));
        assert!(record
            .tags
            .contains(&("peer.service".to_string(), "caller".to_string())));
    }

    #[test]
    fn test_inbound_falls_back_to_wire_tracing_field() {
        let tracer = TestTracer::default();
        let context = TestContext::default();
        let mut call = InboundCall::for_testing("svc", &b"echo"[..], HashMap::new());
        call.tracing = Trace {
            span_id: 5,
            parent_id: 0,
            trace_id: 999,
            flags: 1,
        };

        let span = start_inbound(&mut call, &tracer, &context).unwrap();
        assert_eq!(span.context().wire_ids().unwrap().trace_id, 999);
    }

    #[test]
    fn test_inbound_without_any_parent_starts_fresh_trace() {
        let tracer = TestTracer::default();
        let context = TestContext::default();
        let mut call = InboundCall::for_testing("svc", &b"echo"[..], HashMap::new());

        let span = start_inbound(&mut call, &tracer, &context).unwrap();
        // TestTracer assigns 77 to parentless spans.
        assert_eq!(span.context().wire_ids().unwrap().trace_id, 77);
    }
}
