//! Minimal, host-agnostic implementations of the collaborator traits so
//! the binary runs standalone and the test suite can exercise the full
//! pipeline without a real host.

use crate::ports::{EventLogRecord, EventLogSource, MetricCollector, PrimitiveExecutor, PrimitiveOutcome, PrimitiveParams};
use crate::protected::{is_protected_process, is_protected_service};
use crate::types::Sample;
use async_trait::async_trait;
use endpoint_agent_common::Result;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Token-bucket rate limiter, one per primitive op, mirroring the limits
/// the primitive layer is specified to enforce (`killProcess` <= 10/min,
/// etc.) — not logic the core itself depends on, but realistic behavior
/// for the stub so tests can exercise `rate_limited` outcomes.
struct RateLimiter {
    capacity: u32,
    tokens: u32,
    refill_per_min: u32,
    last_refill: Instant,
}

impl RateLimiter {
    fn new(capacity: u32, refill_per_min: u32) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_per_min,
            last_refill: Instant::now(),
        }
    }

    fn try_acquire(&mut self) -> bool {
        let elapsed = self.last_refill.elapsed();
        if elapsed >= Duration::from_secs(60) {
            self.tokens = self.capacity;
            self.last_refill = Instant::now();
        }
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }
}

fn default_limits() -> HashMap<&'static str, RateLimiter> {
    let mut limits = HashMap::new();
    limits.insert("killProcess", RateLimiter::new(10, 10));
    limits.insert("restartService", RateLimiter::new(5, 5));
    limits.insert("stopService", RateLimiter::new(5, 5));
    limits.insert("cleanTempFiles", RateLimiter::new(2, 2));
    limits.insert("flushDNS", RateLimiter::new(10, 10));
    limits.insert("registryOp", RateLimiter::new(20, 20));
    limits.insert("fileOp", RateLimiter::new(50, 50));
    limits
}

/// Always succeeds except for protected resources and enforced rate
/// limits, matching the inbound primitive contract in the external
/// interfaces section.
pub struct StubPrimitiveExecutor {
    limits: Mutex<HashMap<&'static str, RateLimiter>>,
}

impl Default for StubPrimitiveExecutor {
    fn default() -> Self {
        Self {
            limits: Mutex::new(default_limits()),
        }
    }
}

#[async_trait]
impl PrimitiveExecutor for StubPrimitiveExecutor {
    async fn execute(&self, op: &str, params: &PrimitiveParams) -> Result<PrimitiveOutcome> {
        let start = Instant::now();

        if matches!(op, "killProcess") {
            if let Some(name) = params.get("process_name") {
                if is_protected_process(name) {
                    return Ok(PrimitiveOutcome {
                        success: false,
                        output: None,
                        error: Some("protected process".to_string()),
                        duration_ms: start.elapsed().as_millis() as u64,
                    });
                }
            }
        }

        if matches!(op, "restartService" | "stopService") {
            if let Some(name) = params.get("service_name") {
                if is_protected_service(name) {
                    return Ok(PrimitiveOutcome {
                        success: false,
                        output: None,
                        error: Some("protected service".to_string()),
                        duration_ms: start.elapsed().as_millis() as u64,
                    });
                }
            }
        }

        {
            let mut limits = self.limits.lock().expect("rate limiter mutex poisoned");
            if let Some(limiter) = limits.get_mut(op) {
                if !limiter.try_acquire() {
                    return Ok(PrimitiveOutcome {
                        success: false,
                        output: None,
                        error: Some("rate_limited".to_string()),
                        duration_ms: start.elapsed().as_millis() as u64,
                    });
                }
            }
        }

        Ok(PrimitiveOutcome {
            success: true,
            output: Some(format!("{op} completed")),
            error: None,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// No event log entries; a real adaptor supplies these externally.
#[derive(Default)]
pub struct EmptyEventLogSource;

#[async_trait]
impl EventLogSource for EmptyEventLogSource {
    async fn drain(&self) -> Result<Vec<EventLogRecord>> {
        Ok(Vec::new())
    }
}

/// No samples; a real host collector (WMI, `/proc`, perf counters, ...) is
/// an external collaborator the core only depends on through the trait.
#[derive(Default)]
pub struct EmptyMetricCollector;

#[async_trait]
impl MetricCollector for EmptyMetricCollector {
    async fn collect(&self) -> Result<Vec<Sample>> {
        Ok(Vec::new())
    }
}
