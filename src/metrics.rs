use ::metrics::{counter, histogram};
use tracing::trace;

// Each helper records a `metrics` series (rendered by the Prometheus
// recorder installed in main) and mirrors it as a trace event.

pub fn inc_requests(route: &'static str) {
    counter!("valuer_requests_total", "route" => route).increment(1);
    trace!(
        target = "valuer.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn strategy_attempt(strategy: &str, success: bool, elapsed_ms: u128) {
    let result = if success { "success" } else { "failure" };
    counter!(
        "valuer_strategy_attempts_total",
        "strategy" => strategy.to_string(),
        "result" => result
    )
    .increment(1);
    histogram!("valuer_strategy_attempt_ms", "strategy" => strategy.to_string())
        .record(elapsed_ms as f64);
    trace!(
        target = "valuer.metrics",
        strategy = strategy,
        success = success,
        elapsed_ms = elapsed_ms as u64,
        "strategy_attempt_total_inc"
    );
}

pub fn item_finished(status: &'static str, elapsed_ms: u128) {
    counter!("valuer_items_total", "status" => status).increment(1);
    histogram!("valuer_item_ms").record(elapsed_ms as f64);
    trace!(
        target = "valuer.metrics",
        status = status,
        elapsed_ms = elapsed_ms as u64,
        "items_total_inc"
    );
}

pub fn batch_elapsed(total: usize, elapsed_ms: u128) {
    counter!("valuer_batches_total").increment(1);
    histogram!("valuer_batch_ms").record(elapsed_ms as f64);
    histogram!("valuer_batch_items").record(total as f64);
    trace!(
        target = "valuer.metrics",
        total = total as u64,
        elapsed_ms = elapsed_ms as u64,
        "batch_elapsed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;

    #[test]
    fn helpers_record_prometheus_series() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        ::metrics::with_local_recorder(&recorder, || {
            inc_requests("/process");
            strategy_attempt("direct", false, 12);
            strategy_attempt("placeholder", true, 3);
            item_finished("placeholder", 20);
            batch_elapsed(1, 25);
        });

        let rendered = handle.render();
        assert!(rendered.contains("valuer_requests_total{route=\"/process\"} 1"), "{rendered}");
        assert!(rendered.contains("strategy=\"direct\""));
        assert!(rendered.contains("result=\"failure\""));
        assert!(rendered.contains("valuer_items_total{status=\"placeholder\"} 1"));
        assert!(rendered.contains("valuer_batches_total 1"));
    }
}
