//! `steadfast backoff` – show the retry delay schedule.

use steadfast_core::config::CoreConfig;

pub fn run_backoff(cfg: &CoreConfig, attempts: u32) {
    let policy = cfg.backoff_policy();
    println!(
        "strategy={:?} base={:?} max={:?} jitter={:?}",
        policy.strategy(),
        policy.base(),
        policy.max(),
        policy.jitter()
    );
    println!("  {:>7}  {:>10}  {:>10}", "Attempt", "Capped", "Sampled");
    println!("  {}  {}  {}", "-------", "----------", "----------");
    for attempt in 0..attempts {
        println!(
            "  {:>7}  {:>8}ms  {:>8}ms",
            attempt,
            policy.capped_delay(attempt).as_millis(),
            policy.delay(attempt).as_millis()
        );
    }
    println!("upper bound: {}ms", policy.upper_bound().as_millis());
}
