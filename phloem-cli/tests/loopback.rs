//! End-to-end loopback run: one provider worker and one consumer worker over
//! real sockets, driven by the same supervisor machinery as the binary. The
//! shared stats are the observation point: image retrieval must complete and
//! stamped traffic must produce latency samples on both sides.

use phloem_core::config::HarnessConfig;
use phloem_core::stats::WorkerStats;
use phloem_core::threading::ThreadSupervisor;
use phloem_core::worker::WorkerLoop;
use phloem_protocol::{ConsumerSession, ProviderSession};
use phloem_transport::Acceptor;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const ITEMS: u32 = 24;

fn provider_config() -> HarnessConfig {
    let toml = r#"
role = "provider"

[experiment]
name = "loopback-provider"
seed = 11

[provider]
listen = "127.0.0.1:0"
update_rate = 1000
latency_update_rate = "all"
generic_rate = 0

[pacing]
ticks_per_sec = 500
"#;
    toml::from_str(toml).expect("provider config")
}

fn consumer_config(connect: &str) -> HarnessConfig {
    let toml = format!(
        r#"
role = "consumer"

[experiment]
name = "loopback-consumer"
seed = 12

[consumer]
connect = "{connect}"
item_count = {ITEMS}
request_rate = 1000
generic_rate = 500
latency_generic_rate = "all"

[pacing]
ticks_per_sec = 500
"#
    );
    toml::from_str(&toml).expect("consumer config")
}

fn wait_for(what: &str, deadline: Duration, mut cond: impl FnMut() -> bool) {
    let end = Instant::now() + deadline;
    while !cond() {
        assert!(Instant::now() < end, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_image_retrieval_and_stamped_latency_end_to_end() {
    let provider_config = provider_config();
    provider_config.validate().expect("valid provider config");

    let acceptor = Acceptor::bind(
        provider_config.listen_addr().expect("listen addr"),
        provider_config.channel_options(),
    )
    .expect("bind acceptor");
    let addr = acceptor.local_addr().expect("local addr");
    let acceptor = Arc::new(Mutex::new(acceptor));

    let provider_stats = Arc::new(WorkerStats::new());
    let provider = {
        let config = provider_config.clone();
        let stats = Arc::clone(&provider_stats);
        let acceptor = Arc::clone(&acceptor);
        ThreadSupervisor::spawn(1, move |index, control| {
            let session =
                ProviderSession::new(&config, index, Arc::clone(&acceptor), Arc::clone(&stats))?;
            let mut worker =
                WorkerLoop::new(index, config.poller_kind()?, config.pacing.ticks_per_sec, session)?;
            worker.run(&control)
        })
        .expect("spawn provider")
    };

    let consumer_config = consumer_config(&addr.to_string());
    consumer_config.validate().expect("valid consumer config");

    let consumer_stats = Arc::new(WorkerStats::new());
    let consumer = {
        let config = consumer_config.clone();
        let stats = Arc::clone(&consumer_stats);
        ThreadSupervisor::spawn(1, move |index, control| {
            let session = ConsumerSession::new(&config, index, Arc::clone(&stats))?;
            let mut worker =
                WorkerLoop::new(index, config.poller_kind()?, config.pacing.ticks_per_sec, session)?;
            worker.run(&control)
        })
        .expect("spawn consumer")
    };

    // Startup: every item requested, refreshed, and counted on both sides
    wait_for("image retrieval", Duration::from_secs(10), || {
        consumer_stats.images.total() >= u64::from(ITEMS)
    });
    assert_eq!(consumer_stats.images.total(), u64::from(ITEMS));
    assert_eq!(consumer_stats.item_requests.total(), u64::from(ITEMS));
    assert_eq!(provider_stats.item_requests.total(), u64::from(ITEMS));
    assert_eq!(provider_stats.images.total(), u64::from(ITEMS));
    assert_eq!(consumer_stats.statuses.total(), 0);
    assert!(consumer_stats.msgs_sent.total() >= u64::from(ITEMS));
    assert!(provider_stats.msgs_sent.total() >= u64::from(ITEMS));

    let (start, end) = consumer_stats.image_window_us().expect("image window recorded");
    assert!(end >= start, "image window runs backward: {start}..{end}");

    // Steady state: stamped updates reach the consumer, stamped generics
    // flow back and are measured at the provider
    wait_for("stamped updates", Duration::from_secs(10), || {
        consumer_stats.update_latency.pending_len() > 0
    });
    assert!(consumer_stats.updates.total() > 0);
    assert!(provider_stats.updates.total() > 0);

    wait_for("generic round trip", Duration::from_secs(10), || {
        provider_stats.generic_latency.pending_len() > 0
    });
    assert!(consumer_stats.generics_sent.total() > 0);
    assert!(consumer_stats.latency_generics_sent.total() > 0);
    assert!(provider_stats.generics_received.total() > 0);

    // Consumer goes first so the provider sees a clean close instead of the
    // consumer treating the drop as fatal
    consumer.shutdown().expect("consumer shutdown");
    provider.shutdown().expect("provider shutdown");
}
