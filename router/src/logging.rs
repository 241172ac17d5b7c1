use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::Sampler;
use opentelemetry_sdk::{trace, Resource};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub mod http {
    use axum::{extract::Request, middleware::Next, response::Response};
    use opentelemetry::trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId};
    use opentelemetry::Context;

    /// Span context of the caller that sent a W3C `traceparent` header
    /// (`{version}-{trace_id}-{parent_id}-{flags}`, hex fields of fixed width).
    fn caller_span_context(traceparent: &str) -> Option<SpanContext> {
        let mut fields = traceparent.trim().split('-');
        let (Some(version), Some(trace_id), Some(parent_id), Some(flags), None) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return None;
        };

        // Version ff is forbidden
        if version.len() != 2 || u8::from_str_radix(version, 16).ok()? == 0xff {
            return None;
        }
        if trace_id.len() != 32 || parent_id.len() != 16 || flags.len() != 2 {
            return None;
        }

        let trace_id = TraceId::from_hex(trace_id).ok()?;
        let parent_id = SpanId::from_hex(parent_id).ok()?;
        if trace_id == TraceId::INVALID || parent_id == SpanId::INVALID {
            return None;
        }
        let flags = TraceFlags::new(u8::from_str_radix(flags, 16).ok()?);

        Some(SpanContext::new(
            trace_id,
            parent_id,
            flags,
            true,
            Default::default(),
        ))
    }

    /// Attach the caller's trace to the request as an `Option<Context>` extension, so that
    /// classification spans join the caller's trace.
    pub async fn caller_trace_middleware(mut request: Request, next: Next) -> Response {
        let context = request
            .headers()
            .get("traceparent")
            .and_then(|value| value.to_str().ok())
            .and_then(caller_span_context)
            .map(|span_context| Context::new().with_remote_span_context(span_context));

        request.extensions_mut().insert(context);

        next.run(request).await
    }

}

/// Install the proxy's subscriber.
///
/// Events go to stdout as text, or as flattened JSON records when `json_output` is set
/// (with the enclosing span list unless `disable_spans`). `LOG_LEVEL` holds an `EnvFilter`
/// directive and defaults to `info`. With an `otlp_endpoint`, request and batch spans are
/// also shipped to that collector over gRPC under `otlp_service_name`.
///
/// Returns `true` when a global tracer was installed; it must be shut down before exit so
/// the last spans are flushed.
pub fn init_logging(
    otlp_endpoint: Option<&String>,
    otlp_service_name: String,
    json_output: bool,
    disable_spans: bool,
) -> bool {
    let mut layers = Vec::new();

    // STDOUT/STDERR layer
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_file(true)
        .with_line_number(true);

    let fmt_layer = match json_output {
        true => fmt_layer
            .json()
            .flatten_event(true)
            .with_current_span(!disable_spans)
            .with_span_list(!disable_spans)
            .boxed(),
        false => fmt_layer.boxed(),
    };
    layers.push(fmt_layer);

    // OpenTelemetry tracing layer
    let mut global_tracer = false;
    if let Some(otlp_endpoint) = otlp_endpoint {
        global::set_text_map_propagator(TraceContextPropagator::new());

        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(otlp_endpoint),
            )
            .with_trace_config(
                trace::config()
                    .with_resource(Resource::new(vec![KeyValue::new(
                        "service.name",
                        otlp_service_name,
                    )]))
                    .with_sampler(Sampler::AlwaysOn),
            )
            .install_batch(opentelemetry_sdk::runtime::Tokio);

        match tracer {
            Ok(tracer) => {
                layers.push(tracing_opentelemetry::layer().with_tracer(tracer).boxed());
                global_tracer = true;
            }
            Err(err) => eprintln!("Could not start the OTLP exporter: {err}"),
        }
    }

    // Filter events with LOG_LEVEL
    let env_filter =
        EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .init();
    global_tracer
}
