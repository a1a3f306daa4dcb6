//! Provider side of the market-data session layer
//!
//! A [`ProviderSession`] serves every consumer accepted from a shared
//! [`Acceptor`]: it answers logins, opens requested item streams, and paces
//! update and generic traffic across the open streams each tick. Refresh
//! images owed to newly opened streams drain after the paced bursts with
//! whatever time remains in the tick, so a joining consumer gets its image
//! set at I/O speed without starving steady-state update flow. A stream
//! enters the update rotation only after its image has been sent.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use phloem_core::config::HarnessConfig;
use phloem_core::conn::{ConnId, ConnectionHandle};
use phloem_core::error::{Error, Result};
use phloem_core::event_loop::{ChannelEvents, CloseReason, EventLoop};
use phloem_core::pacing::{LatencyPlan, RateSchedule};
use phloem_core::stats::WorkerStats;
use phloem_core::timing;
use phloem_core::worker::Session;
use phloem_core::{Acceptor, SendStatus};

use crate::codec::{LoginRole, MarketFields, Message, StatusCode};
use crate::send_message;

/// Refresh images sent between checks of the tick deadline
const REFRESH_BURST: usize = 10;

/// Published state of one open item stream
struct ItemState {
    name: String,
    streaming: bool,
    fields: MarketFields,
}

/// Per-consumer session state
#[derive(Default)]
struct ClientSession {
    logged_in: bool,
    items: HashMap<u32, ItemState>,
    /// Streams whose refresh has been sent, in update rotation order
    refreshed: Vec<u32>,
    /// Streams still owed a refresh image
    refresh_backlog: VecDeque<u32>,
}

/// Interactive provider serving consumers accepted from a shared listener
pub struct ProviderSession {
    worker: usize,
    acceptor: Arc<Mutex<Acceptor>>,
    stats: Arc<WorkerStats>,
    update_pacer: RateSchedule,
    generic_pacer: RateSchedule,
    update_plan: LatencyPlan,
    generic_plan: LatencyPlan,
    item_capacity: usize,
    ping_timeout_sec: u32,
    clients: HashMap<ConnId, ClientSession>,
    client_order: Vec<ConnId>,
    rr_client: usize,
    rr_item: usize,
    rng: SmallRng,
}

impl ProviderSession {
    pub fn new(
        config: &HarnessConfig,
        worker: usize,
        acceptor: Arc<Mutex<Acceptor>>,
        stats: Arc<WorkerStats>,
    ) -> Result<Self> {
        let provider = config
            .provider
            .as_ref()
            .ok_or_else(|| Error::Config("missing [provider] section".to_string()))?;
        let ticks = config.pacing.ticks_per_sec;

        let mut rng = match config.experiment.seed {
            Some(seed) => SmallRng::seed_from_u64(seed.wrapping_add(worker as u64)),
            None => SmallRng::from_os_rng(),
        };
        let update_plan =
            LatencyPlan::new(provider.latency_update_rate, provider.update_rate, ticks, &mut rng)?;
        let generic_plan =
            LatencyPlan::new(provider.latency_generic_rate, provider.generic_rate, ticks, &mut rng)?;

        Ok(Self {
            worker,
            acceptor,
            stats,
            update_pacer: RateSchedule::new(provider.update_rate, ticks),
            generic_pacer: RateSchedule::new(provider.generic_rate, ticks),
            update_plan,
            generic_plan,
            item_capacity: provider.item_capacity,
            ping_timeout_sec: config.transport.ping_timeout.as_secs() as u32,
            clients: HashMap::new(),
            client_order: Vec::new(),
            rr_client: 0,
            rr_item: 0,
            rng,
        })
    }

    fn handle_login(
        &mut self,
        conn: &mut ConnectionHandle,
        username: &str,
        role: LoginRole,
    ) -> Result<()> {
        let Some(client) = self.clients.get_mut(&conn.id) else {
            return Err(Error::Connection(format!("{} has no session state", conn.id)));
        };
        if client.logged_in {
            return Err(Error::Protocol(format!("{} sent a second login", conn.id)));
        }
        client.logged_in = true;
        info!(worker = self.worker, conn = %conn.id, username, role = ?role, "login accepted");
        send_message(conn, &Message::LoginAck { ping_timeout_sec: self.ping_timeout_sec })
    }

    fn handle_item_request(
        &mut self,
        conn: &mut ConnectionHandle,
        stream_id: u32,
        name: String,
        streaming: bool,
    ) -> Result<()> {
        let Some(client) = self.clients.get_mut(&conn.id) else {
            return Err(Error::Connection(format!("{} has no session state", conn.id)));
        };
        if !client.logged_in {
            return Err(Error::Protocol(format!("{} requested an item before login", conn.id)));
        }
        if client.items.contains_key(&stream_id) {
            self.stats.statuses.increment();
            return send_message(conn, &Message::Status { stream_id, code: StatusCode::AlreadyOpen });
        }
        if client.items.len() >= self.item_capacity {
            self.stats.statuses.increment();
            return send_message(
                conn,
                &Message::Status { stream_id, code: StatusCode::CapacityExceeded },
            );
        }

        self.stats.item_requests.increment();
        debug!(conn = %conn.id, stream_id, name = %name, streaming, "item stream opened");
        let fields = new_item_fields(&mut self.rng);
        client.items.insert(stream_id, ItemState { name, streaming, fields });
        client.refresh_backlog.push_back(stream_id);
        Ok(())
    }

    fn handle_generic(&mut self, send_time_us: i64) {
        self.stats.generics_received.increment();
        if send_time_us != 0 {
            self.stats.generic_latency.submit(send_time_us, timing::stamp_us(), 1);
        }
    }

    /// Next (client, stream) pair in the send rotation, skipping clients
    /// with nothing refreshed yet. `None` when no stream is eligible.
    fn next_stream(&mut self) -> Option<(ConnId, u32)> {
        for _ in 0..=self.client_order.len() {
            if self.rr_client >= self.client_order.len() {
                self.rr_client = 0;
                self.rr_item = 0;
            }
            let id = *self.client_order.get(self.rr_client)?;
            let Some(client) = self.clients.get(&id) else {
                self.rr_client += 1;
                self.rr_item = 0;
                continue;
            };
            if self.rr_item >= client.refreshed.len() {
                self.rr_client += 1;
                self.rr_item = 0;
                continue;
            }
            let stream = client.refreshed[self.rr_item];
            self.rr_item += 1;
            return Some((id, stream));
        }
        None
    }

    fn has_open_streams(&self) -> bool {
        self.clients.values().any(|c| !c.refreshed.is_empty())
    }

    fn send_update_burst(&mut self, tick: u64, event_loop: &mut EventLoop) -> Result<()> {
        let burst = self.update_pacer.burst_for_tick(tick);
        if burst == 0 || !self.has_open_streams() {
            return Ok(());
        }
        let mark = self.update_plan.burst_mark();

        for position in 0..burst {
            let Some((id, stream_id)) = self.next_stream() else {
                break;
            };
            let payload = match self.clients.get_mut(&id) {
                Some(client) => match client.items.get_mut(&stream_id) {
                    Some(item) => {
                        step_fields(&mut self.rng, &mut item.fields);
                        let send_time_us =
                            if mark.applies_to(position) { timing::stamp_us() } else { 0 };
                        Message::Update { stream_id, fields: item.fields, send_time_us }
                            .to_bytes()?
                    }
                    None => continue,
                },
                None => continue,
            };
            match event_loop.send_to(id, &payload, &mut *self) {
                Ok(SendStatus::NoBuffers) => {
                    // the rest of this burst is abandoned, not deferred
                    self.stats.out_of_buffers.add(burst - position);
                    break;
                }
                Ok(_) => {
                    self.stats.updates.increment();
                    self.stats.msgs_sent.increment();
                }
                Err(e) => debug!(conn = %id, error = %e, "update send failed"),
            }
        }
        Ok(())
    }

    fn send_generic_burst(&mut self, tick: u64, event_loop: &mut EventLoop) -> Result<()> {
        let burst = self.generic_pacer.burst_for_tick(tick);
        if burst == 0 || !self.has_open_streams() {
            return Ok(());
        }
        let mark = self.generic_plan.burst_mark();

        for position in 0..burst {
            let Some((id, stream_id)) = self.next_stream() else {
                break;
            };
            let stamped = mark.applies_to(position);
            let send_time_us = if stamped { timing::stamp_us() } else { 0 };
            let payload = Message::Generic { stream_id, send_time_us }.to_bytes()?;
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
                Err(e) => debug!(conn = %id, error = %e, "generic send failed"),
            }
        }
        Ok(())
    }

    /// Drain queued refresh images with the time left in this tick. Images
    /// go out in passes of [`REFRESH_BURST`] between deadline checks; a
    /// short pass means the backlog is empty or a send hit `NoBuffers`, and
    /// a stream that hit `NoBuffers` stays owed and is retried next tick.
    fn send_refreshes(&mut self, event_loop: &mut EventLoop, stop_at_ns: u64) -> Result<()> {
        loop {
            let sent = self.send_refresh_pass(event_loop)?;
            if sent < REFRESH_BURST || timing::now_ns() >= stop_at_ns {
                return Ok(());
            }
        }
    }

    fn send_refresh_pass(&mut self, event_loop: &mut EventLoop) -> Result<usize> {
        let mut sent = 0;
        let order = self.client_order.clone();
        for id in order {
            while sent < REFRESH_BURST {
                let (stream_id, fields, streaming) = {
                    let Some(client) = self.clients.get_mut(&id) else { break };
                    let Some(stream_id) = client.refresh_backlog.pop_front() else { break };
                    let Some(item) = client.items.get(&stream_id) else { continue };
                    (stream_id, item.fields, item.streaming)
                };
                let payload = Message::Refresh { stream_id, fields, solicited: true }.to_bytes()?;
                match event_loop.send_to(id, &payload, &mut *self) {
                    Ok(SendStatus::NoBuffers) => {
                        if let Some(client) = self.clients.get_mut(&id) {
                            client.refresh_backlog.push_front(stream_id);
                        }
                        return Ok(sent);
                    }
                    Ok(_) => {
                        sent += 1;
                        self.stats.images.increment();
                        self.stats.msgs_sent.increment();
                        if streaming {
                            if let Some(client) = self.clients.get_mut(&id) {
                                client.refreshed.push(stream_id);
                            }
                        }
                    }
                    Err(e) => {
                        debug!(conn = %id, error = %e, "refresh send failed");
                        break;
                    }
                }
            }
            if sent == REFRESH_BURST {
                break;
            }
        }
        Ok(sent)
    }
}

impl ChannelEvents for ProviderSession {
    fn on_channel_active(&mut self, conn: &mut ConnectionHandle) -> Result<()> {
        info!(
            worker = self.worker,
            conn = %conn.id,
            peer = %conn.channel.peer_addr(),
            "consumer connected"
        );
        self.clients.insert(conn.id, ClientSession::default());
        self.client_order.push(conn.id);
        Ok(())
    }

    fn on_payload(&mut self, conn: &mut ConnectionHandle, payload: &[u8]) -> Result<()> {
        let message = Message::parse(payload).map_err(|e| Error::Protocol(e.to_string()))?;
        match message {
            Message::LoginRequest { username, role } => self.handle_login(conn, &username, role),
            Message::ItemRequest { stream_id, name, streaming } => {
                self.handle_item_request(conn, stream_id, name, streaming)
            }
            Message::Generic { send_time_us, .. } => {
                self.handle_generic(send_time_us);
                Ok(())
            }
            other => {
                Err(Error::Protocol(format!("unexpected message from consumer: {other:?}")))
            }
        }
    }

    fn on_channel_close(&mut self, id: ConnId, reason: CloseReason) {
        if self.clients.remove(&id).is_some() {
            info!(worker = self.worker, conn = %id, %reason, "consumer disconnected");
        }
        self.client_order.retain(|c| *c != id);
        self.rr_client = 0;
        self.rr_item = 0;
    }
}

impl Session for ProviderSession {
    fn prepare(&mut self, _event_loop: &mut EventLoop) -> Result<()> {
        info!(worker = self.worker, "provider worker ready");
        Ok(())
    }

    fn poll_endpoint(&mut self, event_loop: &mut EventLoop) -> Result<()> {
        loop {
            let accepted = self.acceptor.lock().unwrap().accept();
            match accepted {
                Ok(Some(channel)) => {
                    debug!(worker = self.worker, peer = %channel.peer_addr(), "accepted");
                    event_loop.add_channel(channel);
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!(worker = self.worker, error = %e, "accept failed");
                    return Ok(());
                }
            }
        }
    }

    fn connected(&self) -> bool {
        true
    }

    fn setup_complete(&self) -> bool {
        true
    }

    fn finished(&self) -> bool {
        false
    }

    fn send_burst(&mut self, tick: u64, event_loop: &mut EventLoop, stop_at_ns: u64) -> Result<()> {
        self.send_update_burst(tick, event_loop)?;
        self.send_generic_burst(tick, event_loop)?;
        self.send_refreshes(event_loop, stop_at_ns)?;
        for id in event_loop.active_ids() {
            event_loop.request_flush(id)?;
        }
        Ok(())
    }
}

fn new_item_fields(rng: &mut SmallRng) -> MarketFields {
    let bid = rng.random_range(10.0..1000.0);
    MarketFields { bid, ask: bid + 0.05, trade_price: bid + 0.025, seq: 0 }
}

fn step_fields(rng: &mut SmallRng, fields: &mut MarketFields) {
    let drift = rng.random_range(-0.25..=0.25);
    fields.bid = (fields.bid + drift).max(0.01);
    fields.ask = fields.bid + 0.05;
    fields.trade_price = fields.bid + 0.025;
    fields.seq = fields.seq.wrapping_add(1);
}
