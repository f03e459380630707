//! Rolling-window provider metrics.
//!
//! One window per provider, samples evicted once they fall past the horizon.
//! Writers are the per-request pipeline tasks; the single reader path is
//! `snapshot`, consumed by the selector and surfaced to observers.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

use jiff::Timestamp;

use crate::tap::TapRole;

#[derive(Debug, Default)]
struct ProviderWindow {
    requests: VecDeque<Timestamp>,
    successes: VecDeque<Timestamp>,
    failures: VecDeque<(Timestamp, u16)>,
    ttft_ms: VecDeque<(Timestamp, f64)>,
    client_ttft_ms: VecDeque<(Timestamp, f64)>,
    duration_ms: VecDeque<(Timestamp, f64)>,
    tokens_per_second: VecDeque<(Timestamp, f64)>,
    input_tokens: VecDeque<(Timestamp, u64)>,
    output_tokens: VecDeque<(Timestamp, u64)>,
    cost: VecDeque<(Timestamp, f64)>,
}

impl ProviderWindow {
    fn evict(&mut self, horizon: Timestamp) {
        fn drain<T>(buffer: &mut VecDeque<T>, horizon: Timestamp, at: impl Fn(&T) -> Timestamp) {
            while buffer.front().is_some_and(|entry| at(entry) < horizon) {
                buffer.pop_front();
            }
        }

        drain(&mut self.requests, horizon, |t| *t);
        drain(&mut self.successes, horizon, |t| *t);
        drain(&mut self.failures, horizon, |(t, _)| *t);
        drain(&mut self.ttft_ms, horizon, |(t, _)| *t);
        drain(&mut self.client_ttft_ms, horizon, |(t, _)| *t);
        drain(&mut self.duration_ms, horizon, |(t, _)| *t);
        drain(&mut self.tokens_per_second, horizon, |(t, _)| *t);
        drain(&mut self.input_tokens, horizon, |(t, _)| *t);
        drain(&mut self.output_tokens, horizon, |(t, _)| *t);
        drain(&mut self.cost, horizon, |(t, _)| *t);
    }
}

/// Aggregated view of one provider's window.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ProviderStats {
    /// Requests started in the window.
    pub request_count: u64,
    /// Successful completions.
    pub success_count: u64,
    /// Failed completions.
    pub error_count: u64,
    /// Mean provider-side time to first token.
    pub avg_ttft_ms: Option<f64>,
    /// Mean client-side time to first token.
    pub avg_client_ttft_ms: Option<f64>,
    /// Mean request duration.
    pub avg_duration_ms: Option<f64>,
    /// Mean output throughput.
    pub tokens_per_second: Option<f64>,
    /// Input tokens spent in the window.
    pub input_tokens: u64,
    /// Output tokens generated in the window.
    pub output_tokens: u64,
    /// Cost accumulated in the window, USD.
    pub total_cost: f64,
}

/// Point-in-time snapshot of every provider's stats.
#[derive(Debug, Default)]
pub struct StatsSnapshot {
    providers: HashMap<String, ProviderStats>,
}

impl StatsSnapshot {
    /// Stats for one provider, when any sample exists in the window.
    pub fn provider(&self, name: &str) -> Option<&ProviderStats> {
        self.providers.get(name)
    }

    /// Iterate all providers with samples.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ProviderStats)> {
        self.providers.iter().map(|(name, stats)| (name.as_str(), stats))
    }
}

/// The collector itself. Cheap to share behind an `Arc`.
pub struct MetricsCollector {
    window: Duration,
    windows: Mutex<HashMap<String, ProviderWindow>>,
}

impl MetricsCollector {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn with_window<F>(&self, provider: &str, f: F)
    where
        F: FnOnce(&mut ProviderWindow, Timestamp),
    {
        let now = Timestamp::now();
        let mut windows = self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let window = windows.entry(provider.to_string()).or_default();

        window.evict(now - self.window);
        f(window, now);
    }

    /// A request was dispatched to the provider.
    pub fn record_start(&self, provider: &str) {
        self.with_window(provider, |window, now| {
            window.requests.push_back(now);
        });
    }

    /// First non-whitespace byte observed on a tap.
    pub fn record_first_token(&self, provider: &str, role: TapRole, elapsed_ms: f64) {
        self.with_window(provider, |window, now| match role {
            TapRole::Provider => window.ttft_ms.push_back((now, elapsed_ms)),
            TapRole::Client => window.client_ttft_ms.push_back((now, elapsed_ms)),
        });
    }

    /// A request completed successfully.
    pub fn record_success(
        &self,
        provider: &str,
        duration_ms: f64,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
    ) {
        self.with_window(provider, |window, now| {
            window.successes.push_back(now);
            window.duration_ms.push_back((now, duration_ms));
            window.input_tokens.push_back((now, input_tokens));
            window.output_tokens.push_back((now, output_tokens));
            window.cost.push_back((now, cost));

            if duration_ms > 0.0 && output_tokens > 0 {
                window
                    .tokens_per_second
                    .push_back((now, output_tokens as f64 / (duration_ms / 1000.0)));
            }
        });
    }

    /// A request failed with the given upstream status (0 for transport
    /// failures).
    pub fn record_failure(&self, provider: &str, http_status: u16) {
        self.with_window(provider, |window, now| {
            window.failures.push_back((now, http_status));
        });
    }

    /// Aggregate every provider's window, evicting stale samples.
    pub fn snapshot(&self) -> StatsSnapshot {
        let now = Timestamp::now();
        let horizon = now - self.window;

        let mut windows = self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut providers = HashMap::with_capacity(windows.len());

        for (name, window) in windows.iter_mut() {
            window.evict(horizon);

            let stats = ProviderStats {
                request_count: window.requests.len() as u64,
                success_count: window.successes.len() as u64,
                error_count: window.failures.len() as u64,
                avg_ttft_ms: mean(window.ttft_ms.iter().map(|(_, v)| *v)),
                avg_client_ttft_ms: mean(window.client_ttft_ms.iter().map(|(_, v)| *v)),
                avg_duration_ms: mean(window.duration_ms.iter().map(|(_, v)| *v)),
                tokens_per_second: mean(window.tokens_per_second.iter().map(|(_, v)| *v)),
                input_tokens: window.input_tokens.iter().map(|(_, v)| *v).sum(),
                output_tokens: window.output_tokens.iter().map(|(_, v)| *v).sum(),
                total_cost: window.cost.iter().map(|(_, v)| *v).sum(),
            };

            providers.insert(name.clone(), stats);
        }

        StatsSnapshot { providers }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let mut sum = 0.0;
    let mut count = 0u64;

    for value in values {
        sum += value;
        count += 1;
    }

    (count > 0).then(|| sum / count as f64)
}
