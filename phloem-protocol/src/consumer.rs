//! Consumer side of the market-data session layer
//!
//! A [`ConsumerSession`] dials the provider, logs in, then paces item
//! requests until its share of the watchlist is open. Every refresh, update,
//! and generic it receives feeds the worker's counters, and stamped messages
//! become latency samples. Generic traffic back toward the provider starts
//! only once the full image set has arrived, so the startup and measurement
//! phases do not overlap.
//!
//! A connect that fails before activation is retried on a fixed delay; a
//! connection lost after activation ends the run for this worker, since
//! samples collected across a provider restart would not be comparable.

use std::net::SocketAddr;
use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use tracing::{debug, error, info, warn};

use phloem_core::config::HarnessConfig;
use phloem_core::conn::{ConnId, ConnectionHandle};
use phloem_core::error::{Error, Result};
use phloem_core::event_loop::{ChannelEvents, CloseReason, EventLoop};
use phloem_core::pacing::{LatencyPlan, RateSchedule};
use phloem_core::stats::WorkerStats;
use phloem_core::timing;
use phloem_core::worker::Session;
use phloem_core::{ChannelOptions, NetChannel, SendStatus};

use crate::codec::{LoginRole, Message, ITEM_STREAM_ID_START};
use crate::send_message;

/// Delay before re-dialing after a failed connect
const RECONNECT_DELAY_NS: u64 = 1_000_000_000;

/// Measuring consumer driving one connection to the provider
pub struct ConsumerSession {
    worker: usize,
    connect_addr: SocketAddr,
    opts: ChannelOptions,
    stats: Arc<WorkerStats>,
    request_pacer: RateSchedule,
    generic_pacer: RateSchedule,
    generic_plan: LatencyPlan,
    /// Global index of this worker's first item name
    item_start: u32,
    /// How many items this worker requests
    item_share: u32,
    requested: u32,
    images: u32,
    conn: Option<ConnId>,
    /// A channel for the current attempt lives in the event loop
    in_flight: bool,
    activated: bool,
    logged_in: bool,
    fatal: bool,
    next_connect_at_ns: u64,
    generic_cursor: u64,
}

impl ConsumerSession {
    pub fn new(config: &HarnessConfig, worker: usize, stats: Arc<WorkerStats>) -> Result<Self> {
        let consumer = config
            .consumer
            .as_ref()
            .ok_or_else(|| Error::Config("missing [consumer] section".to_string()))?;
        let ticks = config.pacing.ticks_per_sec;

        let mut rng = match config.experiment.seed {
            Some(seed) => SmallRng::seed_from_u64(seed.wrapping_add(worker as u64)),
            None => SmallRng::from_os_rng(),
        };
        let generic_plan =
            LatencyPlan::new(consumer.latency_generic_rate, consumer.generic_rate, ticks, &mut rng)?;
        let (item_start, item_share) =
            worker_share(consumer.item_count, config.threads.count, worker);

        Ok(Self {
            worker,
            connect_addr: config.connect_addr()?,
            opts: config.channel_options(),
            stats,
            request_pacer: RateSchedule::new(consumer.request_rate, ticks),
            generic_pacer: RateSchedule::new(consumer.generic_rate, ticks),
            generic_plan,
            item_start,
            item_share,
            requested: 0,
            images: 0,
            conn: None,
            in_flight: false,
            activated: false,
            logged_in: false,
            fatal: false,
            next_connect_at_ns: 0,
            generic_cursor: 0,
        })
    }

    fn handle_refresh(&mut self) {
        if self.images == 0 {
            self.stats.record_image_start(timing::stamp_us());
        }
        self.images += 1;
        self.stats.images.increment();
        if self.images == self.item_share {
            self.stats.record_image_end(timing::stamp_us());
            info!(worker = self.worker, images = self.item_share, "image retrieval complete");
        }
    }

    /// Item requests left this tick carry over; `requested` only advances on
    /// an accepted send, so a full queue defers the rest rather than
    /// dropping it.
    fn send_request_burst(&mut self, tick: u64, id: ConnId, event_loop: &mut EventLoop) -> Result<()> {
        if self.requested >= self.item_share {
            return Ok(());
        }
        let burst = self.request_pacer.burst_for_tick(tick);
        for _ in 0..burst {
            if self.requested >= self.item_share {
                break;
            }
            let stream_id = ITEM_STREAM_ID_START + self.requested;
            let name = format!("item-{}", self.item_start + self.requested);
            let payload = Message::ItemRequest { stream_id, name, streaming: true }.to_bytes()?;
            match event_loop.send_to(id, &payload, &mut *self) {
                Ok(SendStatus::NoBuffers) => break,
                Ok(_) => {
                    self.stats.item_requests.increment();
                    self.stats.msgs_sent.increment();
                    self.requested += 1;
                }
                Err(_) => break,
            }
        }
        Ok(())
    }

    fn send_generic_burst(&mut self, tick: u64, id: ConnId, event_loop: &mut EventLoop) -> Result<()> {
        if self.item_share == 0 || self.images < self.item_share {
            return Ok(());
        }
        let burst = self.generic_pacer.burst_for_tick(tick);
        if burst == 0 {
            return Ok(());
        }
        let mark = self.generic_plan.burst_mark();

        for position in 0..burst {
            let slot = (self.generic_cursor % u64::from(self.item_share)) as u32;
            self.generic_cursor += 1;
            let stamped = mark.applies_to(position);
            let send_time_us = if stamped { timing::stamp_us() } else { 0 };
            let payload =
                Message::Generic { stream_id: ITEM_STREAM_ID_START + slot, send_time_us }
                    .to_bytes()?;
            match event_loop.send_to(id, &payload, &mut *self) {
                Ok(SendStatus::NoBuffers) => {
                    self.stats.out_of_buffers.add(burst - position);
                    break;
                }
                Ok(_) => {
                    self.stats.generics_sent.increment();
                    self.stats.msgs_sent.increment();
                    if stamped {
                        self.stats.latency_generics_sent.increment();
                    }
                }
                Err(_) => break,
            }
        }
        Ok(())
    }
}

impl ChannelEvents for ConsumerSession {
    fn on_channel_active(&mut self, conn: &mut ConnectionHandle) -> Result<()> {
        info!(
            worker = self.worker,
            conn = %conn.id,
            peer = %conn.channel.peer_addr(),
            "connected to provider"
        );
        self.conn = Some(conn.id);
        self.activated = true;
        let login = Message::LoginRequest {
            username: format!("consumer-{}", self.worker),
            role: LoginRole::Consumer,
        };
        send_message(conn, &login)
    }

    fn on_payload(&mut self, _conn: &mut ConnectionHandle, payload: &[u8]) -> Result<()> {
        let message = Message::parse(payload).map_err(|e| Error::Protocol(e.to_string()))?;
        match message {
            Message::LoginAck { ping_timeout_sec } => {
                self.logged_in = true;
                info!(worker = self.worker, ping_timeout_sec, "login accepted by provider");
                Ok(())
            }
            Message::Refresh { .. } => {
                self.handle_refresh();
                Ok(())
            }
            Message::Update { send_time_us, .. } => {
                self.stats.updates.increment();
                if send_time_us != 0 {
                    self.stats.update_latency.submit(send_time_us, timing::stamp_us(), 1);
                }
                Ok(())
            }
            Message::Generic { send_time_us, .. } => {
                self.stats.generics_received.increment();
                if send_time_us != 0 {
                    self.stats.generic_latency.submit(send_time_us, timing::stamp_us(), 1);
                }
                Ok(())
            }
            Message::Status { stream_id, code } => {
                self.stats.statuses.increment();
                warn!(worker = self.worker, stream_id, code = ?code, "stream closed by provider");
                Ok(())
            }
            other => {
                Err(Error::Protocol(format!("unexpected message from provider: {other:?}")))
            }
        }
    }

    fn on_channel_close(&mut self, id: ConnId, reason: CloseReason) {
        if self.conn == Some(id) {
            self.conn = None;
        }
        self.in_flight = false;
        self.logged_in = false;
        let was_activated = self.activated;
        self.activated = false;

        match reason {
            CloseReason::Shutdown => {}
            _ if was_activated => {
                error!(worker = self.worker, conn = %id, %reason, "provider connection lost");
                self.fatal = true;
            }
            _ => {
                warn!(worker = self.worker, %reason, "connect failed, retrying");
                self.next_connect_at_ns = timing::now_ns() + RECONNECT_DELAY_NS;
            }
        }
    }
}

impl Session for ConsumerSession {
    fn prepare(&mut self, _event_loop: &mut EventLoop) -> Result<()> {
        info!(
            worker = self.worker,
            items = self.item_share,
            first = self.item_start,
            "consumer worker ready"
        );
        Ok(())
    }

    fn poll_endpoint(&mut self, event_loop: &mut EventLoop) -> Result<()> {
        if self.fatal || self.in_flight {
            return Ok(());
        }
        let now = timing::now_ns();
        if now < self.next_connect_at_ns {
            return Ok(());
        }
        match NetChannel::connect(self.connect_addr, self.opts.clone()) {
            Ok(channel) => {
                debug!(worker = self.worker, peer = %self.connect_addr, "dialing provider");
                event_loop.add_channel(channel);
                self.in_flight = true;
            }
            Err(e) => {
                warn!(worker = self.worker, error = %e, "connect failed, retrying");
                self.next_connect_at_ns = now + RECONNECT_DELAY_NS;
            }
        }
        Ok(())
    }

    fn connected(&self) -> bool {
        self.activated
    }

    fn setup_complete(&self) -> bool {
        self.logged_in
    }

    fn finished(&self) -> bool {
        self.fatal
    }

    fn send_burst(&mut self, tick: u64, event_loop: &mut EventLoop, _stop_at_ns: u64) -> Result<()> {
        let Some(id) = self.conn else {
            return Ok(());
        };
        if !self.logged_in {
            return Ok(());
        }
        self.send_request_burst(tick, id, event_loop)?;
        self.send_generic_burst(tick, id, event_loop)?;
        event_loop.request_flush(id)?;
        Ok(())
    }
}

/// Contiguous share of `total` items owned by `worker`, as (start, count).
/// The remainder lands on the lowest-numbered workers.
fn worker_share(total: u32, workers: usize, worker: usize) -> (u32, u32) {
    let workers = workers.max(1) as u32;
    let worker = worker as u32;
    let base = total / workers;
    let extra = total % workers;
    let count = base + u32::from(worker < extra);
    let start = worker * base + worker.min(extra);
    (start, count)
}
