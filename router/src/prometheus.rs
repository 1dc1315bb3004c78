use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};

/// Histogram buckets for every metric the router records. The exposition itself is served by
/// the `/metrics` route.
pub(crate) fn prometheus_builer(max_input_length: usize) -> Result<PrometheusBuilder, BuildError> {
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

    // Input Length buckets
    let input_length_matcher = Matcher::Full(String::from("te_request_input_length"));
    let input_length_buckets = input_length_buckets(max_input_length);

    // Documents per rerank request
    let documents_matcher = Matcher::Full(String::from("te_rerank_documents"));
    let documents_buckets: Vec<f64> = (0..13).map(|x| 2.0_f64.powi(x)).collect();

    PrometheusBuilder::new()
        .set_buckets_for_metric(duration_matcher, &duration_buckets)?
        .set_buckets_for_metric(input_length_matcher, &input_length_buckets)?
        .set_buckets_for_metric(documents_matcher, &documents_buckets)
}

fn input_length_buckets(max_input_length: usize) -> Vec<f64> {
    (0..20)
        .map(|x| 2.0_f64.powi(x))
        .filter(|x| (*x as usize) <= max_input_length)
        .collect()
}
