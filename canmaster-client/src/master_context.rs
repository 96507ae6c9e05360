//! The automatic commissioning state machine
//!
//! Drives the LSS fastscan / configure / store / activate sequence end to end, bringing
//! unconfigured nodes onto the bus with an assigned node ID, without an operator driving each LSS
//! step by hand. This mirrors the explicit state machine found in the reference firmware's LSS
//! master loop: nodes are discovered one at a time via fastscan, walked through configuration, and
//! handed a node ID drawn from a bounded pool before the master goes looking for the next one.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use canmaster_common::lss::{LssIdentity, LssState};
use canmaster_common::node_id::NodeId;
use canmaster_common::traits::AsyncCanSender;

use crate::bus_manager::bus_manager::BusManager;
use crate::fw_upload::{self, FwUploadError, ImageType, SdoFirmwareTransport, UploadPlan};
use crate::LssError;

/// The master's own node ID, reserved and never handed out during assignment
pub const MASTER_NODE_ID: u8 = 0x01;
/// The first node ID assigned to a newly discovered node
pub const DEFAULT_FIRST_ASSIGNABLE_ID: u8 = 0x10;
/// The smallest node ID the allocator will ever hand out; the candidate pool wraps back here
pub const MIN_NODE_ID: u8 = 2;
/// The largest node ID assignable under the standard 11-bit COB-ID scheme
pub const MAX_NODE_ID: u8 = 127;
/// Default cap on how many nodes this master will track and keep configured at once
pub const DEFAULT_MAX_CONFIGURED_NODES: usize = 32;
/// Hard ceiling on a single fastscan attempt, regardless of [`MasterConfig::fastscan_timeout`]
///
/// This is a safety floor, not a tunable: a fastscan that runs unbounded could wedge the bus
/// indefinitely if a node never responds, so it is not exposed as an environment variable.
const FASTSCAN_SAFETY_TIMEOUT: Duration = Duration::from_secs(10);
/// Period of the main tick driven by [`MasterContext::run`]
const TICK_PERIOD: Duration = Duration::from_millis(10);
/// Minimum spacing between NMT "enter operational" broadcasts while resting in
/// [`LssMasterState::Done`]
const NMT_BROADCAST_INTERVAL: Duration = Duration::from_secs(1);
/// Minimum spacing between successive firmware upload launches while resting in
/// [`LssMasterState::Done`]
const UPLOAD_STAGGER: Duration = Duration::from_millis(100);

/// Tunable timings and limits for [`MasterContext`]
///
/// Every field can be overridden with an environment variable so a deployment can retune the
/// commissioning loop without a rebuild; see [`MasterConfig::from_env`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterConfig {
    /// This master's own node ID; never handed out to a discovered node
    pub master_node_id: u8,
    /// The first node ID to try handing out to a newly discovered node
    pub first_assignable_id: u8,
    /// Maximum number of nodes this master will keep configured simultaneously
    pub max_configured_nodes: usize,
    /// How long a single fastscan attempt is allowed to run before giving up
    pub fastscan_timeout: Duration,
    /// Minimum time between successive fastscan attempts once a scan has found nothing
    pub rescan_interval: Duration,
    /// How long to wait after deselecting a node before moving on
    pub deselect_delay: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            master_node_id: MASTER_NODE_ID,
            first_assignable_id: DEFAULT_FIRST_ASSIGNABLE_ID,
            max_configured_nodes: DEFAULT_MAX_CONFIGURED_NODES,
            fastscan_timeout: Duration::from_secs(10),
            rescan_interval: Duration::from_secs(5),
            deselect_delay: Duration::from_secs(1),
        }
    }
}

impl MasterConfig {
    /// Build a config by overlaying `CANMASTER_*` environment variables onto [`MasterConfig::default`]
    ///
    /// Unset or unparseable variables fall back to the default silently for unset vars, with a
    /// warning logged for a variable that is set but fails to parse.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            master_node_id: env_u8("CANMASTER_MASTER_NODE_ID", defaults.master_node_id),
            first_assignable_id: env_u8(
                "CANMASTER_FIRST_ASSIGNABLE_ID",
                defaults.first_assignable_id,
            ),
            max_configured_nodes: env_usize(
                "CANMASTER_MAX_CONFIGURED_NODES",
                defaults.max_configured_nodes,
            ),
            fastscan_timeout: env_millis("CANMASTER_FASTSCAN_TIMEOUT_MS", defaults.fastscan_timeout),
            rescan_interval: env_millis("CANMASTER_RESCAN_INTERVAL_MS", defaults.rescan_interval),
            deselect_delay: env_millis("CANMASTER_DESELECT_DELAY_MS", defaults.deselect_delay),
        }
    }
}

fn env_u8(key: &str, default: u8) -> u8 {
    env_parsed(key, default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env_parsed(key, default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    match std::env::var(key) {
        Ok(val) => match val.parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(_) => {
                log::warn!("{key} is set to {val:?}, which is not a valid integer; using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(val) => val.parse().unwrap_or_else(|_| {
            log::warn!("{key} is set to {val:?}, which could not be parsed; using default");
            default
        }),
        Err(_) => default,
    }
}

/// States of the commissioning state machine
///
/// A full cycle walks `Scanning -> ConfigId -> ConfigStore -> Deselect -> Activate` for each node
/// found, landing in `Done` afterward. `Init` is only ever the state before the first tick.
/// `Done` is the steady resting state: it services periodic NMT broadcasts and staggered firmware
/// uploads, and returns to `Scanning` once the rescan interval elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LssMasterState {
    /// Before the first commissioning attempt has run
    Init,
    /// Running LSS fastscan, looking for an unconfigured node
    Scanning,
    /// A node was found; assigning it a node ID
    ConfigId,
    /// Asking the node to persist its new node ID
    ConfigStore,
    /// Returning the node (and the bus) to the waiting LSS mode
    Deselect,
    /// Applying the new configuration via an NMT reset
    Activate,
    /// Resting between commissioning attempts; see the type-level docs
    Done,
}

/// A node successfully brought onto the bus by [`MasterContext`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfiguredNode {
    /// The identity reported by the node during fastscan
    pub identity: LssIdentity,
    /// The node ID assigned to it
    pub node_id: u8,
}

/// Outcome of a single commissioning cycle, see [`MasterContext::run_cycle`]
#[derive(Debug)]
pub enum CommissioningEvent {
    /// Fastscan found and fully commissioned a node
    NodeConfigured(ConfiguredNode),
    /// Fastscan ran and found nothing; the master will try again after the rescan interval
    NoNodeFound,
    /// The configured-node table is full; fastscan was skipped this cycle
    TableFull,
    /// Resting in [`LssMasterState::Done`]; the rescan interval has not elapsed yet
    NotReady,
    /// CONFIG_ID was rejected (illegal argument) for every candidate ID in the pool
    ConfigIdExhausted,
}

/// A firmware image applied uniformly to every node the commissioning loop brings up
///
/// Set with [`MasterContext::set_firmware_source`] to have [`MasterContext::run`] push this image
/// to each newly commissioned node automatically once it settles into [`LssMasterState::Done`].
#[derive(Debug, Clone)]
pub struct FirmwareSource {
    /// The firmware image bytes
    pub image: Arc<[u8]>,
    /// Which image slot this upload targets
    pub image_type: ImageType,
    /// The flash bank the image should be written to
    pub target_bank: u8,
    /// Maximum number of bytes sent per data chunk
    pub max_chunk_bytes: usize,
    /// The version number to record alongside the image
    pub firmware_version: u16,
    /// CRC the node is expected to already be running, if known
    pub expected_crc: Option<u16>,
}

impl FirmwareSource {
    fn plan_for(&self, node_id: u8) -> UploadPlan {
        UploadPlan {
            firmware_path: std::path::PathBuf::new(),
            node_id,
            image_type: self.image_type,
            target_bank: self.target_bank,
            max_chunk_bytes: self.max_chunk_bytes,
            firmware_version: self.firmware_version,
            expected_crc: self.expected_crc,
        }
    }
}

/// Pick the next free node ID per [`MasterContext::allocate_node_id`]'s wraparound rule
///
/// Walks forward from `next_id`, wrapping from [`MAX_NODE_ID`] back to [`MIN_NODE_ID`], skipping
/// the master's own ID and any ID already in `configured`. Visits at most `MAX_NODE_ID -
/// MIN_NODE_ID + 1` distinct candidates before giving up, so a caller retrying on a per-candidate
/// rejection is automatically bounded.
fn next_assignable_id(config: &MasterConfig, configured: &[ConfiguredNode], next_id: u8) -> Option<u8> {
    let span = (MAX_NODE_ID - MIN_NODE_ID + 1) as u16;
    for offset in 0..span {
        let candidate = MIN_NODE_ID + ((next_id as u16 - MIN_NODE_ID as u16 + offset) % span) as u8;
        if candidate == config.master_node_id {
            continue;
        }
        if !configured.iter().any(|n| n.node_id == candidate) {
            return Some(candidate);
        }
    }
    None
}

/// Pick the next candidate after `rejected`, for use when a candidate ID is itself rejected
fn next_candidate_after(config: &MasterConfig, configured: &[ConfiguredNode], rejected: u8) -> Option<u8> {
    let start = if rejected >= MAX_NODE_ID { MIN_NODE_ID } else { rejected + 1 };
    next_assignable_id(config, configured, start)
}

/// Runs the commissioning state machine on top of a borrowed [`BusManager`]
///
/// Borrowing rather than owning the bus manager lets a caller interleave manual commands (reads,
/// writes, NMT commands) with automatic commissioning cycles on the same bus connection.
#[derive(Debug)]
pub struct MasterContext<'a, S: AsyncCanSender + Sync + Send> {
    config: MasterConfig,
    bus: &'a mut BusManager<S>,
    state: LssMasterState,
    configured: Vec<ConfiguredNode>,
    next_id: u8,
    last_scan_attempt: Option<Instant>,
    last_nmt_broadcast: Option<Instant>,
    last_upload_launch: Option<Instant>,
    uploaders_launched: bool,
    upload_queue: VecDeque<u8>,
    firmware_source: Option<FirmwareSource>,
}

impl<'a, S: AsyncCanSender + Sync + Send> MasterContext<'a, S> {
    /// Build a new commissioning context around a [`BusManager`]
    pub fn new(bus: &'a mut BusManager<S>, config: MasterConfig) -> Self {
        let next_id = config.first_assignable_id;
        Self {
            config,
            bus,
            state: LssMasterState::Init,
            configured: Vec::new(),
            next_id,
            last_scan_attempt: None,
            last_nmt_broadcast: None,
            last_upload_launch: None,
            uploaders_launched: true,
            upload_queue: VecDeque::new(),
            firmware_source: None,
        }
    }

    /// The state machine's current state
    pub fn state(&self) -> LssMasterState {
        self.state
    }

    /// Nodes successfully commissioned so far
    pub fn configured_nodes(&self) -> &[ConfiguredNode] {
        &self.configured
    }

    /// Apply a firmware image to every node the commissioning loop brings onto the bus
    ///
    /// Only consulted by [`Self::run`]/[`Self::run_lss_step`] while resting in
    /// [`LssMasterState::Done`]; [`Self::run_cycle`] alone never uploads firmware.
    pub fn set_firmware_source(&mut self, source: FirmwareSource) {
        self.firmware_source = Some(source);
    }

    /// Whether the master is ready to attempt another fastscan right now
    pub fn ready_for_scan(&self) -> bool {
        if self.configured.len() >= self.config.max_configured_nodes {
            return false;
        }
        match self.last_scan_attempt {
            None => true,
            Some(t) => t.elapsed() >= self.config.rescan_interval,
        }
    }

    /// Pick the next node ID to offer a newly discovered node
    ///
    /// Walks forward from the last assigned ID, wrapping from [`MAX_NODE_ID`] back to
    /// [`MIN_NODE_ID`], and skipping both the master's own ID and any ID already in the
    /// configured table. Returns `None` if every assignable ID is already in use.
    fn allocate_node_id(&self) -> Option<u8> {
        next_assignable_id(&self.config, &self.configured, self.next_id)
    }

    fn advance_next_id(&mut self, assigned: u8) {
        self.next_id = if assigned >= MAX_NODE_ID { MIN_NODE_ID } else { assigned + 1 };
    }

    /// Run the commissioning loop indefinitely, advancing the state machine on a fixed tick
    ///
    /// Mirrors the reference firmware's processing cycle: a fixed-period tick drives a single
    /// state transition rather than a caller synchronously driving commissioning to completion.
    /// Intended for an embedder that owns the bus outright; the interactive CLI instead calls
    /// [`Self::run_cycle`] once per operator command.
    pub async fn run(&mut self) -> ! {
        let mut tick = tokio::time::interval(TICK_PERIOD);
        loop {
            tick.tick().await;
            if let Err(e) = self.run_lss_step().await {
                log::warn!("Commissioning cycle error: {e}");
            }
        }
    }

    /// Advance the commissioning state machine by one tick
    ///
    /// While resting in [`LssMasterState::Done`] this first services the steady-state duties
    /// (periodic NMT broadcast, staggered firmware upload launch), then attempts a commissioning
    /// cycle, which becomes a no-op until the rescan interval elapses.
    pub async fn run_lss_step(&mut self) -> Result<CommissioningEvent, LssError> {
        if self.state == LssMasterState::Done {
            self.service_done_state().await;
        }
        self.run_cycle().await
    }

    async fn service_done_state(&mut self) {
        let now = Instant::now();

        let broadcast_due = match self.last_nmt_broadcast {
            None => true,
            Some(t) => now.duration_since(t) >= NMT_BROADCAST_INTERVAL,
        };
        if broadcast_due {
            self.bus.nmt_start(0).await;
            self.last_nmt_broadcast = Some(now);
        }

        if self.uploaders_launched {
            return;
        }
        let Some(source) = self.firmware_source.clone() else {
            self.uploaders_launched = true;
            return;
        };
        if self.upload_queue.is_empty() {
            self.upload_queue = self
                .configured
                .iter()
                .map(|n| n.node_id)
                .filter(|&id| id != self.config.master_node_id)
                .collect();
        }

        let launch_due = match self.last_upload_launch {
            None => true,
            Some(t) => now.duration_since(t) >= UPLOAD_STAGGER,
        };
        if !launch_due {
            return;
        }

        match self.upload_queue.pop_front() {
            Some(node_id) => {
                self.last_upload_launch = Some(now);
                let plan = source.plan_for(node_id);
                if let Err(e) = self.upload_firmware(&plan, &source.image).await {
                    log::warn!("Firmware upload to node {node_id} failed: {e}");
                }
            }
            None => self.uploaders_launched = true,
        }
    }

    /// Run one commissioning cycle: a single fastscan attempt, and if a node is found, the full
    /// configure/store/deselect/activate sequence for it.
    ///
    /// Only one newly discovered node is commissioned per call. The caller is expected to call
    /// this repeatedly (see [`MasterConfig::rescan_interval`]) as part of its own tick loop, or
    /// use [`Self::run`]/[`Self::run_lss_step`] for the automatic driver.
    pub async fn run_cycle(&mut self) -> Result<CommissioningEvent, LssError> {
        if self.configured.len() >= self.config.max_configured_nodes {
            return Ok(CommissioningEvent::TableFull);
        }
        if let Some(t) = self.last_scan_attempt {
            if t.elapsed() < self.config.rescan_interval {
                return Ok(CommissioningEvent::NotReady);
            }
        }

        self.state = LssMasterState::Scanning;
        // A fresh scan attempt means any node brought up in a prior stretch has already had its
        // firmware upload launch considered; let a newly added node get queued again.
        self.uploaders_launched = false;
        self.upload_queue.clear();

        let scan_timeout = self.config.fastscan_timeout.min(FASTSCAN_SAFETY_TIMEOUT);
        let mut found = self.bus.lss_fastscan(scan_timeout).await;
        let Some(identity) = found.pop() else {
            self.last_scan_attempt = Some(Instant::now());
            self.state = LssMasterState::Done;
            return Ok(CommissioningEvent::NoNodeFound);
        };

        self.state = LssMasterState::ConfigId;
        self.bus.lss_activate(identity).await?;

        // A node that re-announces an identity we've already commissioned keeps its prior node
        // ID rather than being handed a new one, so the registry entry is refreshed in place
        // instead of gaining a duplicate.
        let previously_assigned = self
            .configured
            .iter()
            .find(|n| n.identity == identity)
            .map(|n| n.node_id);
        let mut assigned = match previously_assigned {
            Some(id) => id,
            None => match self.allocate_node_id() {
                Some(id) => id,
                None => {
                    self.bus.lss_set_global_mode(LssState::Waiting).await;
                    self.state = LssMasterState::Done;
                    return Ok(CommissioningEvent::TableFull);
                }
            },
        };

        loop {
            let node_id =
                NodeId::new(assigned).expect("candidates are always drawn from MIN_NODE_ID..=MAX_NODE_ID");
            match self.bus.lss_set_node_id(node_id).await {
                Ok(()) => break,
                Err(LssError::NodeIdConfigError { .. }) => {
                    match next_candidate_after(&self.config, &self.configured, assigned) {
                        Some(next) => assigned = next,
                        None => {
                            self.bus.lss_set_global_mode(LssState::Waiting).await;
                            self.state = LssMasterState::Done;
                            return Ok(CommissioningEvent::ConfigIdExhausted);
                        }
                    }
                }
                Err(other) => return Err(other),
            }
        }

        self.state = LssMasterState::ConfigStore;
        self.bus.lss_store_config().await?;

        // Store succeeded: the node is committed to this ID. Record it immediately rather than
        // deferring until after activation, so a crash between here and Activate still leaves the
        // registry consistent with what the node actually persisted.
        let node = ConfiguredNode {
            identity,
            node_id: assigned,
        };
        match self.configured.iter_mut().find(|n| n.identity == identity) {
            Some(existing) => *existing = node,
            None => {
                self.advance_next_id(assigned);
                self.configured.push(node);
            }
        }

        self.state = LssMasterState::Deselect;
        self.bus.lss_set_global_mode(LssState::Waiting).await;
        tokio::time::sleep(self.config.deselect_delay).await;

        self.state = LssMasterState::Activate;
        self.bus.nmt_start(assigned).await;

        self.state = LssMasterState::Done;

        log::info!("Commissioned node {assigned} with identity {identity:?}");
        Ok(CommissioningEvent::NodeConfigured(node))
    }

    /// Upload firmware to a configured node's SDO firmware transfer objects
    ///
    /// Reads the node's currently stored CRC and firmware version first and skips the transfer
    /// entirely if they already match `plan`'s expected values. Honors `plan.expected_crc` when
    /// set instead of recomputing the CRC from `image`.
    pub async fn upload_firmware(
        &mut self,
        plan: &UploadPlan,
        image: &[u8],
    ) -> Result<(), FwUploadError> {
        let expected_crc = match plan.expected_crc {
            Some(crc) if crc != 0 => crc,
            _ => fw_upload::Crc16Ccitt::of(image),
        };
        let mut transport = SdoFirmwareTransport::new(self.bus.sdo_client(plan.node_id));

        if !fw_upload::needs_upload(&mut transport, plan.node_id, expected_crc, plan.firmware_version).await {
            return Ok(());
        }

        fw_upload::upload_firmware(&mut transport, plan, image).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> MasterConfig {
        MasterConfig {
            master_node_id: 0x01,
            first_assignable_id: 0x10,
            max_configured_nodes: 3,
            fastscan_timeout: Duration::from_millis(10),
            rescan_interval: Duration::from_millis(10),
            deselect_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn default_config_matches_reference_constants() {
        let cfg = MasterConfig::default();
        assert_eq!(MASTER_NODE_ID, cfg.master_node_id);
        assert_eq!(DEFAULT_FIRST_ASSIGNABLE_ID, cfg.first_assignable_id);
        assert_eq!(DEFAULT_MAX_CONFIGURED_NODES, cfg.max_configured_nodes);
    }

    #[test]
    fn allocate_node_id_skips_master_and_used_ids() {
        let config = test_config();
        let configured = vec![ConfiguredNode {
            identity: LssIdentity::new(1, 2, 3, 4),
            node_id: 0x10,
        }];
        assert_eq!(Some(0x11), next_assignable_id(&config, &configured, 0x10));
    }

    #[test]
    fn reannouncing_identity_updates_registry_in_place_not_duplicated() {
        let identity = LssIdentity::new(1, 2, 3, 4);
        let mut configured = vec![ConfiguredNode {
            identity,
            node_id: 0x10,
        }];

        // Simulate the node re-announcing itself: the prior node_id is found and reused, and the
        // registry entry is replaced rather than appended.
        let previously_assigned = configured
            .iter()
            .find(|n| n.identity == identity)
            .map(|n| n.node_id);
        assert_eq!(Some(0x10), previously_assigned);

        let refreshed = ConfiguredNode {
            identity,
            node_id: previously_assigned.unwrap(),
        };
        match configured.iter_mut().find(|n| n.identity == identity) {
            Some(existing) => *existing = refreshed,
            None => configured.push(refreshed),
        }

        assert_eq!(1, configured.len());
        assert_eq!(0x10, configured[0].node_id);
    }

    #[test]
    fn allocate_node_id_wraps_and_reports_full() {
        let config = test_config();
        let mut configured = Vec::new();
        for id in MIN_NODE_ID..=MAX_NODE_ID {
            if id != config.master_node_id {
                configured.push(ConfiguredNode {
                    identity: LssIdentity::new(0, 0, 0, id as u32),
                    node_id: id,
                });
            }
        }
        // 2..=127 excluding the master's own ID (1, already outside the range) is exactly 126
        // distinct IDs, matching the "visits no more than 126 distinct IDs" boundary.
        assert_eq!(126, configured.len());
        assert_eq!(None, next_assignable_id(&config, &configured, MAX_NODE_ID));
    }

    #[test]
    fn allocate_node_id_wraps_from_max_back_to_min() {
        let config = test_config();
        let configured = Vec::new();
        assert_eq!(Some(MIN_NODE_ID), next_assignable_id(&config, &configured, MAX_NODE_ID));
    }

    #[test]
    fn next_candidate_after_skips_rejected_id() {
        let config = test_config();
        let configured = Vec::new();
        assert_eq!(Some(0x11), next_candidate_after(&config, &configured, 0x10));
        assert_eq!(Some(MIN_NODE_ID), next_candidate_after(&config, &configured, MAX_NODE_ID));
    }
}
