//! Bidirectional request/response channel over a pair of rings
//!
//! Both endpoints construct the channel with the same name. A named lock
//! (`<name>_owner_mutex`) elects the creator of the shared resources as the
//! owner; the other endpoint becomes the peer and opens what the owner
//! created, adopting the ring geometry it finds. Requests flow through one
//! ring and replies through the other, each packetized under a 64-byte
//! framing header so messages larger than a node are reassembled on the far
//! side.
//!
//! A process-wide send lock keeps the packets of one message contiguous on
//! the wire. A pool of receive workers reads the inbound ring with a bounded
//! timeout, correlates replies to outstanding requests, reassembles inbound
//! requests, and dispatches them to the channel's handler.

use crate::frame::{self, PacketHeader, PacketKind, HEADER_SIZE, MAX_NODE_CAPACITY, MIN_NODE_CAPACITY};
use crate::handler::RpcHandler;
use crate::platform::{self, NamedLock};
use crate::ring::{Ring, MIN_NODE_COUNT};
use crate::stats::ChannelStats;
use crate::{IpcError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Budget for pushing one packet into the outbound ring
const SEND_PACKET_TIMEOUT: Duration = Duration::from_millis(1000);

/// How long a worker blocks in one ring read before re-checking shutdown
const WORKER_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Slice between completion, cancellation and shutdown checks while waiting
const WAIT_POLL_SLICE: Duration = Duration::from_millis(50);

/// How long a peer polls for rings the owner has not created yet
const PEER_OPEN_RETRIES: u32 = 50;
const PEER_OPEN_DELAY: Duration = Duration::from_millis(100);

/// Which side of the channel this endpoint won in role election
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creator of the named regions, rings and events
    Owner,
    /// Opener of resources the owner created
    Peer,
}

/// Framing protocol revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    #[default]
    V1,
}

/// Channel construction options
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Channel identity; every named resource derives from it
    pub name: String,
    /// Per-node byte capacity of each ring (owner side; peers adopt)
    pub buffer_capacity: u32,
    /// Nodes per ring (owner side; peers adopt)
    pub buffer_node_count: u32,
    /// Framing version
    pub protocol_version: ProtocolVersion,
    /// Receive worker count; must be at least 2 when the handler issues
    /// nested requests on the same channel
    pub receive_threads: usize,
}

impl ChannelConfig {
    /// Options with production defaults for the given channel name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            buffer_capacity: 65_536,
            buffer_node_count: 64,
            protocol_version: ProtocolVersion::V1,
            receive_threads: 1,
        }
    }

    fn validate(&self) -> Result<()> {
        platform::validate_name(&self.name)?;
        if !(MIN_NODE_CAPACITY..=MAX_NODE_CAPACITY).contains(&self.buffer_capacity) {
            return Err(IpcError::OutOfRange {
                what: "buffer_capacity",
                value: self.buffer_capacity as u64,
                min: MIN_NODE_CAPACITY as u64,
                max: MAX_NODE_CAPACITY as u64,
            });
        }
        if self.buffer_node_count < MIN_NODE_COUNT {
            return Err(IpcError::OutOfRange {
                what: "buffer_node_count",
                value: self.buffer_node_count as u64,
                min: MIN_NODE_COUNT as u64,
                max: u32::MAX as u64,
            });
        }
        if self.receive_threads == 0 {
            return Err(IpcError::OutOfRange {
                what: "receive_threads",
                value: 0,
                min: 1,
                max: u16::MAX as u64,
            });
        }
        Ok(())
    }
}

/// Outcome of a remote request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcResponse {
    pub success: bool,
    pub data: Vec<u8>,
}

impl RpcResponse {
    fn failure() -> Self {
        Self::default()
    }
}

/// Cooperative cancellation flag for in-flight requests
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every request holding this token to give up
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Outstanding-request record: completion state plus reply reassembly
struct PendingRequest {
    state: Mutex<PendingState>,
    cond: Condvar,
    created_at: Instant,
}

#[derive(Default)]
struct PendingState {
    done: bool,
    success: bool,
    data: Vec<u8>,
    partial: Option<Vec<u8>>,
}

impl PendingRequest {
    fn new() -> Self {
        Self {
            state: Mutex::new(PendingState::default()),
            cond: Condvar::new(),
            created_at: Instant::now(),
        }
    }

    fn write_chunk(&self, total: usize, offset: usize, chunk: &[u8]) {
        let mut state = self.state.lock();
        let buf = state.partial.get_or_insert_with(|| vec![0u8; total]);
        if offset + chunk.len() <= buf.len() {
            buf[offset..offset + chunk.len()].copy_from_slice(chunk);
        }
    }

    fn complete(&self, success: bool) {
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        state.done = true;
        state.success = success;
        state.data = if success {
            state.partial.take().unwrap_or_default()
        } else {
            Vec::new()
        };
        self.cond.notify_all();
    }
}

/// Inbound multi-packet request being reassembled
struct Assembly {
    buf: Vec<u8>,
}

struct ChannelCore {
    name: String,
    role: Role,
    read_ring: Ring,
    write_ring: Ring,
    body_per_packet: usize,
    next_msg_id: AtomicU64,
    pending: Mutex<HashMap<u64, Arc<PendingRequest>>>,
    assembly: Mutex<HashMap<u64, Assembly>>,
    send_lock: Mutex<()>,
    handler: Option<RpcHandler>,
    stats: ChannelStats,
    disposed: AtomicBool,
    owner_lock: Mutex<Option<NamedLock>>,
    rt_handle: tokio::runtime::Handle,
}

impl ChannelCore {
    fn alloc_id(&self) -> u64 {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(IpcError::AlreadyDisposed);
        }
        if self.read_ring.is_shutdown() || self.write_ring.is_shutdown() {
            return Err(IpcError::Shutdown);
        }
        Ok(())
    }

    /// Frame `payload` into packets and push them through the outbound ring
    ///
    /// The exclusive send lock is held for the whole message so its packets
    /// never interleave with another message's. `Ok(false)` means a packet
    /// could not be placed within its budget.
    fn send_message(
        &self,
        kind: PacketKind,
        msg_id: u64,
        payload: &[u8],
        response_id: u64,
    ) -> Result<bool> {
        if u32::try_from(payload.len()).is_err() {
            return Err(IpcError::OutOfRange {
                what: "payload size",
                value: payload.len() as u64,
                min: 0,
                max: u32::MAX as u64,
            });
        }
        let total = frame::packet_count(payload.len(), self.body_per_packet)?;

        let _guard = self.send_lock.lock();
        let mut offset = 0usize;
        for current in 1..=total {
            let body_len = (payload.len() - offset).min(self.body_per_packet);
            let header = PacketHeader {
                kind,
                msg_id,
                payload_size: payload.len() as u32,
                current_packet: current,
                total_packets: total,
                response_id,
            }
            .to_bytes();
            let chunk = &payload[offset..offset + body_len];

            let started = Instant::now();
            let wrote = self.write_ring.write_with(
                |buf| {
                    buf[..HEADER_SIZE].copy_from_slice(&header);
                    buf[HEADER_SIZE..HEADER_SIZE + body_len].copy_from_slice(chunk);
                    HEADER_SIZE + body_len
                },
                Some(SEND_PACKET_TIMEOUT),
            );
            let waited = started.elapsed().as_millis() as u64;
            if waited > 0 {
                self.stats.record_send_wait(waited);
            }

            if wrote == 0 {
                if self.write_ring.is_shutdown() {
                    return Err(IpcError::Shutdown);
                }
                warn!(
                    channel = %self.name,
                    msg_id,
                    current,
                    total,
                    "outbound ring stalled; giving up on message"
                );
                return Ok(false);
            }
            self.stats.record_packet_sent(wrote);
            offset += body_len;
        }
        self.stats.record_message_sent(payload.len());
        Ok(true)
    }

    /// Unblock every outstanding request with a failure result
    fn fail_all_pending(&self) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        for (_, pending) in drained {
            pending.complete(false);
        }
    }

    fn handle_packet(self: &Arc<Self>, header: PacketHeader, body: &[u8]) {
        if body.len() != header.body_len(self.body_per_packet) {
            self.stats.record_malformed_frame();
            warn!(
                channel = %self.name,
                msg_id = header.msg_id,
                got = body.len(),
                "packet body length disagrees with its header; dropping"
            );
            return;
        }
        match header.kind {
            PacketKind::Response | PacketKind::Error => self.handle_reply(header, body),
            PacketKind::Request => self.handle_request_packet(header, body),
        }
    }

    fn handle_reply(&self, header: PacketHeader, body: &[u8]) {
        let pending = self.pending.lock().get(&header.response_id).cloned();
        let Some(pending) = pending else {
            // Correlator gone: the caller timed out or never waited.
            self.stats.record_discarded_response(header.response_id);
            debug!(
                channel = %self.name,
                response_id = header.response_id,
                "discarding reply with no outstanding request"
            );
            return;
        };

        if header.payload_size > 0 {
            let offset = (header.current_packet as usize - 1) * self.body_per_packet;
            pending.write_chunk(header.payload_size as usize, offset, body);
        }

        if header.current_packet == header.total_packets {
            self.pending.lock().remove(&header.response_id);
            self.stats.record_message_received(header.payload_size as usize);
            match header.kind {
                PacketKind::Response => {
                    self.stats.record_response_received();
                    pending.complete(true);
                }
                _ => {
                    self.stats.record_error_received();
                    pending.complete(false);
                }
            }
        }
    }

    fn handle_request_packet(self: &Arc<Self>, header: PacketHeader, body: &[u8]) {
        let completed = {
            let mut assemblies = self.assembly.lock();
            let entry = assemblies.entry(header.msg_id).or_insert_with(|| Assembly {
                buf: vec![0u8; header.payload_size as usize],
            });
            let offset = (header.current_packet as usize - 1) * self.body_per_packet;
            if offset + body.len() <= entry.buf.len() {
                entry.buf[offset..offset + body.len()].copy_from_slice(body);
            }
            if header.current_packet == header.total_packets {
                assemblies.remove(&header.msg_id).map(|a| a.buf)
            } else {
                None
            }
        };

        let Some(payload) = completed else { return };
        self.stats.record_request_received();
        self.stats.record_message_received(header.payload_size as usize);
        self.dispatch_request(header.msg_id, payload);
    }

    fn dispatch_request(self: &Arc<Self>, request_id: u64, payload: Vec<u8>) {
        let outcome = match &self.handler {
            Some(handler) => handler.invoke(request_id, payload, &self.rt_handle),
            None => Err("no request handler configured".into()),
        };
        let (kind, reply) = match outcome {
            Ok(bytes) => (PacketKind::Response, bytes),
            Err(error) => {
                warn!(channel = %self.name, request_id, %error, "request handler failed");
                (PacketKind::Error, Vec::new())
            }
        };

        let reply_id = self.alloc_id();
        match self.send_message(kind, reply_id, &reply, request_id) {
            Ok(true) => match kind {
                PacketKind::Response => self.stats.record_response_sent(),
                _ => self.stats.record_error_sent(),
            },
            Ok(false) => warn!(channel = %self.name, request_id, "reply stalled in outbound ring"),
            Err(error) => debug!(channel = %self.name, request_id, %error, "reply not sent"),
        }
    }
}

fn worker_loop(core: Arc<ChannelCore>, index: usize) {
    debug!(channel = %core.name, index, "receive worker started");
    let capacity = core.read_ring.node_buffer_size() as usize;
    let mut buf = vec![0u8; capacity];

    loop {
        if core.disposed.load(Ordering::Acquire) {
            break;
        }
        if core.read_ring.is_shutdown() || core.write_ring.is_shutdown() {
            core.fail_all_pending();
            break;
        }

        let started = Instant::now();
        let n = core.read_ring.read(&mut buf, Some(WORKER_READ_TIMEOUT));
        if n == 0 {
            continue;
        }
        let waited = started.elapsed().as_millis() as u64;
        if waited > 0 {
            core.stats.record_receive_wait(waited);
        }
        core.stats.record_packet_received(n);

        match PacketHeader::from_bytes(&buf[..n]) {
            Ok(header) => core.handle_packet(header, &buf[HEADER_SIZE..n]),
            Err(error) => {
                core.stats.record_malformed_frame();
                warn!(channel = %core.name, index, %error, "dropping malformed packet");
            }
        }
    }
    debug!(channel = %core.name, index, "receive worker stopped");
}

fn open_ring_with_retry(name: &str) -> Result<Ring> {
    let mut last = None;
    for _ in 0..PEER_OPEN_RETRIES {
        match Ring::open(name) {
            Ok(ring) => return Ok(ring),
            Err(e @ (IpcError::NameNotFound(_) | IpcError::Platform(_))) => {
                last = Some(e);
                thread::sleep(PEER_OPEN_DELAY);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| IpcError::NameNotFound(name.to_string())))
}

fn request_on(
    core: &Arc<ChannelCore>,
    payload: &[u8],
    timeout_ms: u64,
    cancel: Option<&CancelToken>,
) -> Result<RpcResponse> {
    core.ensure_live()?;
    let msg_id = core.alloc_id();
    core.stats.record_request_sent();

    // timeout 0 is fire-and-forget: no correlator is registered, the reply
    // (if any) will be counted as discarded, and the caller never waits.
    if timeout_ms == 0 {
        core.send_message(PacketKind::Request, msg_id, payload, 0)?;
        return Ok(RpcResponse::failure());
    }

    let pending = Arc::new(PendingRequest::new());
    core.pending.lock().insert(msg_id, pending.clone());

    let sent = match core.send_message(PacketKind::Request, msg_id, payload, 0) {
        Ok(sent) => sent,
        Err(e) => {
            core.pending.lock().remove(&msg_id);
            return Err(e);
        }
    };
    if !sent {
        core.pending.lock().remove(&msg_id);
        return Ok(RpcResponse::failure());
    }

    let response = wait_for_completion(core, &pending, timeout_ms, cancel);
    core.pending.lock().remove(&msg_id);
    response
}

fn wait_for_completion(
    core: &Arc<ChannelCore>,
    pending: &PendingRequest,
    timeout_ms: u64,
    cancel: Option<&CancelToken>,
) -> Result<RpcResponse> {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let mut state = pending.state.lock();
    loop {
        if state.done {
            return Ok(RpcResponse {
                success: state.success,
                data: std::mem::take(&mut state.data),
            });
        }
        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Ok(RpcResponse::failure());
        }
        let now = Instant::now();
        if now >= deadline {
            core.stats.record_timeout();
            debug!(
                channel = %core.name,
                age_ms = pending.created_at.elapsed().as_millis() as u64,
                "request timed out; a late reply will be discarded"
            );
            return Ok(RpcResponse::failure());
        }
        let slice = (deadline - now).min(WAIT_POLL_SLICE);
        pending.cond.wait_for(&mut state, slice);
    }
}

/// One endpoint of a named request/response channel
pub struct RpcChannel {
    core: Arc<ChannelCore>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
}

impl RpcChannel {
    /// Construct an endpoint, electing the owner role if the name is free
    ///
    /// The handler, when present, is invoked for every fully received
    /// inbound request. Endpoints that only issue requests may pass `None`;
    /// requests arriving at such an endpoint are answered with error
    /// replies.
    pub fn new(config: ChannelConfig, handler: Option<RpcHandler>) -> Result<Self> {
        config.validate()?;

        let p2o_name = format!("{}_p2o", config.name);
        let o2p_name = format!("{}_o2p", config.name);
        let election = NamedLock::try_acquire(&format!("{}_owner_mutex", config.name))?;

        let (role, read_ring, write_ring, owner_lock) = match election {
            Some(lock) => {
                let p2o = Ring::create(&p2o_name, config.buffer_node_count, config.buffer_capacity)?;
                let o2p = Ring::create(&o2p_name, config.buffer_node_count, config.buffer_capacity)?;
                (Role::Owner, p2o, o2p, Some(lock))
            }
            None => {
                let o2p = open_ring_with_retry(&o2p_name)?;
                let p2o = open_ring_with_retry(&p2o_name)?;
                (Role::Peer, o2p, p2o, None)
            }
        };

        // The peer adopts whatever geometry the owner created; its own
        // capacity and node count options are ignored by design.
        let capacity = write_ring.node_buffer_size();
        if !(MIN_NODE_CAPACITY..=MAX_NODE_CAPACITY).contains(&capacity) {
            return Err(IpcError::OutOfRange {
                what: "buffer_capacity",
                value: capacity as u64,
                min: MIN_NODE_CAPACITY as u64,
                max: MAX_NODE_CAPACITY as u64,
            });
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(format!("mem-portal-rt-{}", config.name))
            .enable_all()
            .build()?;

        let core = Arc::new(ChannelCore {
            name: config.name.clone(),
            role,
            read_ring,
            write_ring,
            body_per_packet: frame::body_per_packet(capacity as usize),
            next_msg_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            assembly: Mutex::new(HashMap::new()),
            send_lock: Mutex::new(()),
            handler,
            stats: ChannelStats::new(),
            disposed: AtomicBool::new(false),
            owner_lock: Mutex::new(owner_lock),
            rt_handle: runtime.handle().clone(),
        });

        let workers = (0..config.receive_threads)
            .map(|i| {
                let core = core.clone();
                thread::Builder::new()
                    .name(format!("mem-portal-rx-{}", i))
                    .spawn(move || worker_loop(core, i))
                    .map_err(IpcError::Io)
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(channel = %config.name, ?role, workers = config.receive_threads, "channel up");
        Ok(Self {
            core,
            workers: Mutex::new(workers),
            runtime: Mutex::new(Some(runtime)),
        })
    }

    /// Which role this endpoint was elected into
    pub fn role(&self) -> Role {
        self.core.role
    }

    /// Channel name
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Per-node byte capacity actually in force (peers report the owner's)
    pub fn buffer_capacity(&self) -> u32 {
        self.core.write_ring.node_buffer_size()
    }

    /// Traffic counters for this endpoint
    pub fn stats(&self) -> &ChannelStats {
        &self.core.stats
    }

    /// Send a request and block until the reply, a timeout, or cancellation
    ///
    /// `timeout_ms == 0` sends fire-and-forget: the call returns immediately
    /// with `success == false` and the reply, if one ever arrives, is
    /// discarded. Timeouts, handler failures on the peer, and cancellation
    /// all surface as `success == false`; `Err` is reserved for shutdown,
    /// disposal and construction-grade failures.
    pub fn remote_request(
        &self,
        payload: &[u8],
        timeout_ms: u64,
        cancel: Option<&CancelToken>,
    ) -> Result<RpcResponse> {
        request_on(&self.core, payload, timeout_ms, cancel)
    }

    /// Non-blocking variant of [`remote_request`](Self::remote_request)
    pub async fn remote_request_async(
        &self,
        payload: Vec<u8>,
        timeout_ms: u64,
        cancel: Option<CancelToken>,
    ) -> Result<RpcResponse> {
        let core = self.core.clone();
        tokio::task::spawn_blocking(move || request_on(&core, &payload, timeout_ms, cancel.as_ref()))
            .await
            .map_err(|e| IpcError::Platform(format!("request task join failed: {}", e)))?
    }

    /// Tear this endpoint down
    ///
    /// Idempotent. The owner marks both shared regions shut down, which
    /// peers observe at their next wait. Workers are woken and joined,
    /// outstanding requests complete with failure, and every name owned by
    /// this endpoint is unlinked. Must not be called from inside a handler.
    pub fn dispose(&self) {
        if self.core.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(channel = %self.core.name, role = ?self.core.role, "disposing channel");

        if self.core.role == Role::Owner {
            self.core.read_ring.mark_shutdown();
            self.core.write_ring.mark_shutdown();
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        for _ in &workers {
            self.core.read_ring.pulse_data();
        }
        self.core.fail_all_pending();
        for worker in workers {
            let _ = worker.join();
        }

        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        if let Some(mut lock) = self.core.owner_lock.lock().take() {
            lock.release();
        }
        self.core.read_ring.unlink_now();
        self.core.write_ring.unlink_now();
    }
}

impl Drop for RpcChannel {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::test_support::unique_name;

    fn config(name: &str) -> ChannelConfig {
        let mut cfg = ChannelConfig::new(name);
        cfg.buffer_capacity = 1024;
        cfg.buffer_node_count = 8;
        cfg
    }

    #[test]
    fn test_config_validation() {
        let mut cfg = config(&unique_name("rpc_cfg"));
        cfg.buffer_capacity = 255;
        assert!(matches!(
            RpcChannel::new(cfg, None),
            Err(IpcError::OutOfRange { .. })
        ));

        let mut cfg = config(&unique_name("rpc_cfg"));
        cfg.buffer_capacity = 1_048_577;
        assert!(matches!(
            RpcChannel::new(cfg, None),
            Err(IpcError::OutOfRange { .. })
        ));

        let mut cfg = config(&unique_name("rpc_cfg"));
        cfg.receive_threads = 0;
        assert!(matches!(
            RpcChannel::new(cfg, None),
            Err(IpcError::OutOfRange { .. })
        ));

        let mut cfg = config(&unique_name("rpc_cfg"));
        cfg.buffer_node_count = 1;
        assert!(matches!(
            RpcChannel::new(cfg, None),
            Err(IpcError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_role_election() {
        let name = unique_name("rpc_roles");
        let first = RpcChannel::new(config(&name), None).unwrap();
        let second = RpcChannel::new(config(&name), None).unwrap();
        assert_eq!(first.role(), Role::Owner);
        assert_eq!(second.role(), Role::Peer);
    }

    #[test]
    fn test_peer_adopts_owner_geometry() {
        let name = unique_name("rpc_geometry");
        let owner = RpcChannel::new(config(&name), None).unwrap();

        // The peer asks for a different capacity and is overruled.
        let mut peer_cfg = config(&name);
        peer_cfg.buffer_capacity = 4096;
        peer_cfg.buffer_node_count = 32;
        let peer = RpcChannel::new(peer_cfg, None).unwrap();
        assert_eq!(peer.buffer_capacity(), owner.buffer_capacity());
        assert_eq!(peer.buffer_capacity(), 1024);
    }

    #[test]
    fn test_simple_roundtrip() {
        let name = unique_name("rpc_echo");
        let handler = RpcHandler::sync_bytes(|_, payload| {
            let mut reversed = payload.to_vec();
            reversed.reverse();
            Ok(reversed)
        });
        let _owner = RpcChannel::new(config(&name), Some(handler)).unwrap();
        let peer = RpcChannel::new(config(&name), None).unwrap();

        let response = peer.remote_request(&[1, 2, 3], 5_000, None).unwrap();
        assert!(response.success);
        assert_eq!(response.data, vec![3, 2, 1]);

        let snap = peer.stats().snapshot();
        assert_eq!(snap.requests_sent, 1);
        assert_eq!(snap.responses_received, 1);
    }

    #[test]
    fn test_fire_and_forget_never_waits() {
        let name = unique_name("rpc_forget");
        let handler = RpcHandler::sync_void(|_, _| Ok(()));
        let _owner = RpcChannel::new(config(&name), Some(handler)).unwrap();
        let peer = RpcChannel::new(config(&name), None).unwrap();

        let started = Instant::now();
        let response = peer.remote_request(&[1], 0, None).unwrap();
        assert!(!response.success);
        assert!(response.data.is_empty());
        assert!(started.elapsed() < Duration::from_millis(500));

        // The unsolicited reply eventually lands in the discard counter.
        let deadline = Instant::now() + Duration::from_secs(2);
        while peer.stats().snapshot().discarded_responses == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(peer.stats().snapshot().discarded_responses, 1);
    }

    #[test]
    fn test_cancellation_unblocks() {
        let name = unique_name("rpc_cancel");
        let handler = RpcHandler::sync_bytes(|_, _| {
            thread::sleep(Duration::from_secs(2));
            Ok(Vec::new())
        });
        let _owner = RpcChannel::new(config(&name), Some(handler)).unwrap();
        let peer = Arc::new(RpcChannel::new(config(&name), None).unwrap());

        let token = CancelToken::new();
        let request = {
            let peer = peer.clone();
            let token = token.clone();
            thread::spawn(move || peer.remote_request(&[1], 10_000, Some(&token)).unwrap())
        };
        thread::sleep(Duration::from_millis(100));
        token.cancel();
        let response = request.join().unwrap();
        assert!(!response.success);
    }

    #[test]
    fn test_dispose_is_terminal() {
        let name = unique_name("rpc_dispose");
        let owner = RpcChannel::new(config(&name), None).unwrap();
        owner.dispose();
        owner.dispose();
        assert!(matches!(
            owner.remote_request(&[], 100, None),
            Err(IpcError::AlreadyDisposed)
        ));
    }
}
