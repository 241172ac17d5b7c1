use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};

/// Histogram buckets for the metrics reported by the proxy. The recorder is installed by the
/// HTTP server, which also serves the `/metrics` route.
pub(crate) fn prometheus_builder(
    max_batch_requests: usize,
    max_retries: usize,
) -> Result<PrometheusBuilder, BuildError> {
    // Duration buckets
    let duration_matcher = Matcher::Suffix(String::from("duration"));
    let n_duration_buckets = 35;
    let mut duration_buckets = Vec::with_capacity(n_duration_buckets);
    // Minimum duration in seconds
    let mut value = 0.00001;
    for _ in 0..n_duration_buckets {
        // geometric sequence
        value *= 1.5;
        duration_buckets.push(value);
    }

    // Input length buckets, in characters
    let input_length_matcher = Matcher::Full(String::from("cp_classify_input_length"));
    let input_length_buckets: Vec<f64> = (0..20).map(|x| 2.0_f64.powi(x)).collect();

    // Batch size buckets
    let batch_size_matcher = Matcher::Full(String::from("cp_batch_next_size"));
    let batch_size_buckets: Vec<f64> = (1..=max_batch_requests).map(|x| x as f64).collect();

    // Attempts per batch buckets
    let attempts_matcher = Matcher::Full(String::from("cp_batch_attempts"));
    let attempts_buckets: Vec<f64> = (1..=max_retries).map(|x| x as f64).collect();

    PrometheusBuilder::new()
        .set_buckets_for_metric(duration_matcher, &duration_buckets)?
        .set_buckets_for_metric(input_length_matcher, &input_length_buckets)?
        .set_buckets_for_metric(batch_size_matcher, &batch_size_buckets)?
        .set_buckets_for_metric(attempts_matcher, &attempts_buckets)
}
