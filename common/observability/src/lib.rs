use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Prometheus counters for the checkout confirmation flow.
#[derive(Clone)]
pub struct CheckoutMetrics {
    pub registry: Registry,
    pub poll_attempts: IntCounterVec,
    pub terminal_states: IntCounterVec,
    pub reconciliation_mismatches: IntCounter,
    pub broadcast_signals: IntCounterVec,
    pub collaborator_errors: IntCounterVec,
}

impl CheckoutMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let poll_attempts = IntCounterVec::new(
            Opts::new("checkout_poll_attempts_total", "Payment status poll attempts"),
            &["source"],
        )?;
        let terminal_states = IntCounterVec::new(
            Opts::new(
                "checkout_terminal_states_total",
                "Checkout attempts reaching a terminal state",
            ),
            &["state", "reason"],
        )?;
        let reconciliation_mismatches = IntCounter::new(
            "checkout_reconciliation_mismatch_total",
            "Payment reported success but the order did not reach a paid status in budget",
        )?;
        let broadcast_signals = IntCounterVec::new(
            Opts::new(
                "checkout_broadcast_signals_total",
                "Cross-context completion signals received",
            ),
            &["channel", "disposition"],
        )?;
        let collaborator_errors = IntCounterVec::new(
            Opts::new(
                "checkout_collaborator_errors_total",
                "Failed calls to order/payment/cart collaborators",
            ),
            &["service", "operation"],
        )?;
        registry.register(Box::new(poll_attempts.clone()))?;
        registry.register(Box::new(terminal_states.clone()))?;
        registry.register(Box::new(reconciliation_mismatches.clone()))?;
        registry.register(Box::new(broadcast_signals.clone()))?;
        registry.register(Box::new(collaborator_errors.clone()))?;
        Ok(Self {
            registry,
            poll_attempts,
            terminal_states,
            reconciliation_mismatches,
            broadcast_signals,
            collaborator_errors,
        })
    }

    pub fn record_poll_attempt(&self, source: &str) {
        self.poll_attempts.with_label_values(&[source]).inc();
    }

    pub fn record_terminal(&self, state: &str, reason: &str) {
        self.terminal_states.with_label_values(&[state, reason]).inc();
    }

    pub fn record_mismatch(&self) {
        self.reconciliation_mismatches.inc();
    }

    pub fn record_signal(&self, channel: &str, disposition: &str) {
        self.broadcast_signals
            .with_label_values(&[channel, disposition])
            .inc();
    }

    pub fn record_collaborator_error(&self, service: &str, operation: &str) {
        self.collaborator_errors
            .with_label_values(&[service, operation])
            .inc();
    }

    /// Render the registry in the prometheus text exposition format.
    pub fn render(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_recorded_series() {
        let metrics = CheckoutMetrics::new().unwrap();
        metrics.record_poll_attempt("payment");
        metrics.record_terminal("timeout", "awaiting_confirmation");
        metrics.record_mismatch();
        let text = metrics.render().unwrap();
        assert!(text.contains("checkout_poll_attempts_total{source=\"payment\"} 1"));
        assert!(text.contains("checkout_reconciliation_mismatch_total 1"));
        assert!(text.contains("state=\"timeout\""));
    }
}
