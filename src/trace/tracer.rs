//! Tracer collaborator traits.
//!
//! The tracer is an injected collaborator with a deliberately narrow
//! surface: build a span, inject/extract a span context through a text-map
//! carrier. Extra abilities are modeled as explicit capability queries
//! rather than type identity:
//! - a [`SpanContext`] may expose the 64-bit wire ids ([`SpanContext::wire_ids`])
//! - a [`TracingContext`] may expose a [`RequestSpanInterceptor`]
//!   ([`TracingContext::interceptor`])

use thiserror::Error;

use crate::call::CallRequest;
use crate::connection::InboundCall;
use crate::protocol::Trace;

/// Failure inside the tracer or an interceptor.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TraceError(pub String);

/// Write half of a text-map carrier.
pub trait TextMapWriter {
    /// Store one key/value pair.
    fn put(&mut self, key: &str, value: &str);
}

/// Read half of a text-map carrier.
pub trait TextMapReader {
    /// All key/value pairs, in no particular order.
    fn entries(&self) -> Vec<(String, String)>;
}

/// Serialized form of a span's identity.
pub trait SpanContext: Send + Sync {
    /// The protocol-level 64-bit ids, if this tracer can express them.
    ///
    /// Capability query: tracers whose contexts do not map onto 64-bit
    /// trace/span/parent ids return `None` and the wire tracing field is
    /// left alone.
    fn wire_ids(&self) -> Option<Trace> {
        None
    }

    /// Clone into an owned box, for storing on a [`TracingContext`].
    fn clone_boxed(&self) -> Box<dyn SpanContext>;
}

/// One timed operation.
pub trait Span: Send + Sync {
    /// This span's identity.
    fn context(&self) -> &dyn SpanContext;

    /// Attach a tag.
    fn set_tag(&mut self, key: &str, value: &str);

    /// Record a log event of key/value fields.
    fn log_event(&mut self, fields: &[(&str, &str)]);

    /// Mark the span finished. Called exactly once.
    fn finish(&mut self);
}

impl std::fmt::Debug for dyn Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Span")
    }
}

/// Builder returned by [`Tracer::build_span`].
pub trait SpanBuilder {
    /// Declare `parent` as this span's parent.
    fn child_of(&mut self, parent: &dyn SpanContext);

    /// Attach a tag to the span being built.
    fn tag(&mut self, key: &str, value: &str);

    /// Start the span.
    fn start(self: Box<Self>) -> Box<dyn Span>;
}

/// The tracer collaborator.
pub trait Tracer: Send + Sync {
    /// Begin building a span named `operation`.
    fn build_span(&self, operation: &str) -> Box<dyn SpanBuilder>;

    /// Serialize `context` into the carrier.
    fn inject(
        &self,
        context: &dyn SpanContext,
        carrier: &mut dyn TextMapWriter,
    ) -> Result<(), TraceError>;

    /// Recover a span context from the carrier, if one is present.
    fn extract(&self, carrier: &dyn TextMapReader) -> Option<Box<dyn SpanContext>>;
}

/// Per-task holder of the current span, supplied by the host.
pub trait TracingContext: Send + Sync {
    /// The current span's context, if any.
    fn current(&self) -> Option<Box<dyn SpanContext>>;

    /// Push a new current span context.
    fn push(&self, context: Box<dyn SpanContext>);

    /// Drop all stored contexts.
    fn clear(&self);

    /// Optional interceptor capability.
    fn interceptor(&self) -> Option<&dyn RequestSpanInterceptor> {
        None
    }
}

/// Hook invoked between span creation and return.
///
/// A failure aborts the call: outbound requests fail before a frame id is
/// allocated, inbound requests fail before reaching the handler.
pub trait RequestSpanInterceptor: Send + Sync {
    /// Inspect or annotate an outbound request and its client span.
    fn intercept_outbound(
        &self,
        request: &CallRequest,
        span: &mut dyn Span,
    ) -> Result<(), TraceError>;

    /// Inspect or annotate an inbound request and its server span.
    fn intercept_inbound(
        &self,
        request: &InboundCall,
        span: &mut dyn Span,
    ) -> Result<(), TraceError>;
}

/// Span context synthesized from the protocol-level tracing field, used
/// when a request carries wire ids but no `$tracing$` headers.
#[derive(Debug, Clone, Copy)]
pub struct WireSpanContext {
    ids: Trace,
}

impl WireSpanContext {
    /// Wrap the wire tracing field.
    pub fn new(ids: Trace) -> Self {
        Self { ids }
    }
}

impl SpanContext for WireSpanContext {
    fn wire_ids(&self) -> Option<Trace> {
        Some(self.ids)
    }

    fn clone_boxed(&self) -> Box<dyn SpanContext> {
        Box::new(*self)
    }
}
