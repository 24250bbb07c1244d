//! The discovered-peripheral tracker.
//!
//! [`DiscoveredPeripheralTracker`] turns the noisy stream of BLE sightings
//! into stable found/lost events. A sighting can surface an advertisement
//! over several paths (fast service data, an extended advertisement, a DCT
//! frame, or an advertisement header that gates a GATT read) and the tracker
//! correlates all of them by advertisement header so that clients hear about
//! each (service, advertisement) pair exactly once.
//!
//! All state lives behind one lock (single-writer); callbacks are dispatched
//! after the lock is released, and every dispatch first checks the
//! cancellation flag. The only long-running step, the GATT fetch, runs either
//! inline or on a dedicated worker thread depending on
//! `enable_gatt_query_in_thread`; a fetch result that arrives after
//! `stop_tracking` is discarded without callbacks.

pub mod lost;
pub mod read_result;

use std::collections::{HashMap, HashSet};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;

use crate::adv::bloom::BloomFilter;
use crate::adv::dct::{generate_endpoint_id, DctAdvertisement};
use crate::adv::header::{AdvertisementHeader, Version as HeaderVersion};
use crate::adv::instant_loss::InstantLossAdvertisement;
use crate::adv::legacy::BleAdvertisement;
use crate::config::{
    FeatureFlags, Pcp, COPRESENCE_SERVICE_UUID, DCT_SERVICE_UUID, DUMMY_ADVERTISEMENT_BYTES,
};
use crate::hashing::{advertisement_hash, service_id_hash};
use crate::time::{Clock, Duration, Instant, SystemClock};
use crate::utils::{CancellationFlag, HexSlice};
use crate::uuid::Uuid128;

use self::lost::LostEntityTracker;
use self::read_result::{AdvertisementReadResult, RetryStatus};

/// Slot count assumed for synthesized headers when the real value is unknown.
const MAX_SLOTS_FALLBACK: u8 = 10;

/// How long an extended-capable header must keep being sighted before a GATT
/// read is issued anyway (the extended advertisement usually arrives first).
const EXTENDED_READ_DELAY: Duration = Duration::from_secs(4);

/// A pending extended-capable header older than this is stale; the wait
/// starts over.
const EXTENDED_PENDING_EXPIRY: Duration = Duration::from_secs(20);

/// How long a forced-loss hash keeps suppressing rediscovery.
const LOST_HASH_EXPIRY: Duration = Duration::from_secs(10 * 60);

/// A sighted BLE device, identified by whatever stable id the radio driver
/// provides (typically the MAC address).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Peripheral {
    pub id: String,
}

/// The advertisement payload of one sighting.
#[derive(Debug, Clone, Default)]
pub struct AdvertisementData {
    /// The advertised local name, when present (iOS peripherals put the
    /// advertisement header here).
    pub local_name: Option<String>,
    /// Service UUID to service-data payloads.
    pub service_data: HashMap<Uuid128, Bytes>,
    /// Whether the sighting arrived via extended advertising, in which case
    /// the copresence service data holds the full advertisement instead of a
    /// header.
    pub is_extended_advertisement: bool,
}

/// Callback invoked with `(peripheral, service_id, advertisement_data,
/// fast_advertisement)`.
pub type PeripheralCallback = Box<dyn Fn(Peripheral, &str, &Bytes, bool) + Send + Sync>;

/// Callback invoked when a legacy device that cannot carry a real
/// advertisement header is sighted.
pub type LegacyDeviceCallback = Box<dyn Fn() + Send + Sync>;

/// Callback invoked with a DCT endpoint id whose (device name, dedup) pair
/// collided with an earlier sighting.
pub type DctCollisionCallback = Box<dyn Fn(&str) + Send + Sync>;

/// The per-service callback set registered through
/// [`DiscoveredPeripheralTracker::start_tracking`]. Unset callbacks are
/// skipped.
#[derive(Default)]
pub struct DiscoveryCallbacks {
    pub peripheral_discovered_cb: Option<PeripheralCallback>,
    pub peripheral_lost_cb: Option<PeripheralCallback>,
    pub instant_lost_cb: Option<PeripheralCallback>,
    pub legacy_device_discovered_cb: Option<LegacyDeviceCallback>,
    pub dct_collision_cb: Option<DctCollisionCallback>,
}

/// Fetches the GATT advertisements behind a header.
///
/// Invoked with the peripheral, the header's slot count and PSM, the tracked
/// service ids that passed the header's bloom filter, and the read result to
/// populate. Implementations must call
/// [`AdvertisementReadResult::record_last_read_status`] and must not retain
/// the reference after returning.
pub type AdvertisementFetcher = Box<
    dyn FnOnce(&Peripheral, u8, Option<u16>, &[String], &mut AdvertisementReadResult) + Send,
>;

struct TrackedService {
    callbacks: Arc<DiscoveryCallbacks>,
    fast_advertisement_service_uuid: Option<Uuid128>,
    include_dct: bool,
    /// Endpoint id -> (device name, dedup) of DCT sightings already reported.
    dct_endpoints: HashMap<String, (String, u8)>,
}

/// A callback invocation collected under the lock and delivered after it is
/// released.
enum Dispatch {
    Discovered {
        callbacks: Arc<DiscoveryCallbacks>,
        peripheral: Peripheral,
        service_id: String,
        data: Bytes,
        fast_advertisement: bool,
    },
    Lost {
        callbacks: Arc<DiscoveryCallbacks>,
        peripheral: Peripheral,
        service_id: String,
        data: Bytes,
        fast_advertisement: bool,
    },
    InstantLost {
        callbacks: Arc<DiscoveryCallbacks>,
        peripheral: Peripheral,
        service_id: String,
        data: Bytes,
        fast_advertisement: bool,
    },
    LegacyDevice {
        callbacks: Arc<DiscoveryCallbacks>,
    },
    DctCollision {
        callbacks: Arc<DiscoveryCallbacks>,
        endpoint_id: String,
    },
}

#[derive(Default)]
struct TrackerState {
    tracked_services: HashMap<String, TrackedService>,
    lost_trackers: HashMap<String, LostEntityTracker<BleAdvertisement>>,
    read_results: HashMap<AdvertisementHeader, AdvertisementReadResult>,
    /// Header -> advertisements last seen under it.
    parsed_advertisements: HashMap<AdvertisementHeader, HashSet<BleAdvertisement>>,
    advertisement_services: HashMap<BleAdvertisement, String>,
    advertisement_headers: HashMap<BleAdvertisement, AdvertisementHeader>,
    /// Advertisement -> 4-byte hash of the raw bytes it arrived as, matched
    /// against forced-loss frames.
    advertisement_hashes: HashMap<BleAdvertisement, Bytes>,
    /// Advertisement -> last peripheral id it was sighted from.
    peripheral_ids: HashMap<BleAdvertisement, String>,
    /// Advertisements to report lost on the next sweep (forced loss with
    /// `enable_instant_on_lost` off).
    forced_lost: HashMap<String, HashSet<BleAdvertisement>>,
    /// Hashes from forced-loss frames that suppress rediscovery.
    lost_hash_blocklist: HashMap<Bytes, Instant>,
    /// First-sighting instants of extended-capable headers being deferred.
    extended_pending: HashMap<AdvertisementHeader, Instant>,
}

type Job = Box<dyn FnOnce() + Send>;

struct GattWorker {
    sender: Option<mpsc::Sender<Job>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl GattWorker {
    fn spawn() -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let handle = thread::spawn(move || {
            while let Ok(job) = receiver.recv() {
                job();
            }
        });
        Self {
            sender: Some(sender),
            handle: Some(handle),
        }
    }

    fn submit(&self, job: Job) -> Result<(), Job> {
        match &self.sender {
            Some(sender) => sender.send(job).map_err(|e| e.0),
            None => Err(job),
        }
    }
}

impl Drop for GattWorker {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Correlates sightings into found/lost events. See the module docs.
pub struct DiscoveredPeripheralTracker {
    state: Arc<Mutex<TrackerState>>,
    clock: Arc<dyn Clock>,
    flags: FeatureFlags,
    cancellation: CancellationFlag,
    worker: Option<GattWorker>,
}

impl DiscoveredPeripheralTracker {
    /// Creates a tracker on the system clock.
    pub fn new(flags: FeatureFlags) -> Self {
        Self::with_clock(flags, Arc::new(SystemClock::new()), CancellationFlag::new())
    }

    /// Creates a tracker on an explicit clock and cancellation flag; tests
    /// drive this with a [`crate::time::FakeClock`].
    pub fn with_clock(
        flags: FeatureFlags,
        clock: Arc<dyn Clock>,
        cancellation: CancellationFlag,
    ) -> Self {
        let worker = if flags.enable_gatt_query_in_thread {
            Some(GattWorker::spawn())
        } else {
            None
        };
        Self {
            state: Arc::new(Mutex::new(TrackerState::default())),
            clock,
            flags,
            cancellation,
            worker,
        }
    }

    /// Starts tracking discoveries for `service_id`.
    ///
    /// Any per-service state from an earlier session is dropped and all GATT
    /// read results are cleared, so every peripheral in range gets re-read
    /// and rediscovery is guaranteed.
    pub fn start_tracking(
        &self,
        service_id: &str,
        include_dct: bool,
        pcp: Pcp,
        callbacks: DiscoveryCallbacks,
        fast_advertisement_service_uuid: Option<Uuid128>,
    ) {
        debug!("start tracking {} under {:?}", service_id, pcp);
        let mut state = self.lock();

        state.tracked_services.insert(
            service_id.to_owned(),
            TrackedService {
                callbacks: Arc::new(callbacks),
                fast_advertisement_service_uuid,
                include_dct,
                dct_endpoints: HashMap::new(),
            },
        );

        // A pre-existing lost tracker only contains stale advertisements.
        state
            .lost_trackers
            .insert(service_id.to_owned(), LostEntityTracker::new());
        state.forced_lost.remove(service_id);
        state.lost_hash_blocklist.clear();

        state.read_results.clear();
        state.clear_data_for_service_id(service_id);
    }

    /// Stops tracking `service_id`. No callbacks fire for it afterwards;
    /// results of in-flight GATT fetches are discarded.
    pub fn stop_tracking(&self, service_id: &str) {
        let mut state = self.lock();
        state.tracked_services.remove(service_id);
        state.lost_trackers.remove(service_id);
        state.forced_lost.remove(service_id);
    }

    /// Ingests one sighting.
    pub fn process_found(
        &self,
        peripheral: Peripheral,
        advertisement_data: AdvertisementData,
        fetcher: AdvertisementFetcher,
    ) {
        let mut state = self.lock();
        if state.tracked_services.is_empty() {
            trace!("ignoring sighting: no tracked service ids");
            return;
        }

        let mut dispatches = Vec::new();
        let mut pending_fetch = None;

        if advertisement_data.is_extended_advertisement {
            state.handle_extended_advertisement(
                &self.flags,
                &self.clock,
                &peripheral,
                &advertisement_data,
                &mut dispatches,
            );
        } else {
            state.handle_fast_advertisement(
                &self.flags,
                &self.clock,
                &peripheral,
                &advertisement_data,
                &mut dispatches,
            );
            state.handle_dct_advertisement(&peripheral, &advertisement_data, &mut dispatches);
            pending_fetch = state.handle_advertisement_header(
                &self.flags,
                &self.clock,
                &peripheral,
                &advertisement_data,
                &mut dispatches,
            );
        }
        drop(state);

        run_dispatches(&self.cancellation, dispatches);

        if let Some((header, interesting_service_ids)) = pending_fetch {
            self.fetch_gatt_advertisements(peripheral, header, interesting_service_ids, fetcher);
        }
    }

    /// Runs the two-phase sweep and reports lost peripherals. Callers invoke
    /// this on the `ble_peripheral_lost_timeout` cadence.
    pub fn process_lost_gatt_advertisements(&self) {
        let mut state = self.lock();
        let mut dispatches = Vec::new();

        let service_ids: Vec<String> = state.tracked_services.keys().cloned().collect();
        for service_id in service_ids {
            let mut lost = match state.lost_trackers.get_mut(&service_id) {
                Some(tracker) => tracker.compute_lost_entities(),
                None => continue,
            };
            if let Some(forced) = state.forced_lost.remove(&service_id) {
                if let Some(tracker) = state.lost_trackers.get_mut(&service_id) {
                    for advertisement in &forced {
                        tracker.forget(advertisement);
                    }
                }
                lost.extend(forced);
            }

            let callbacks = match state.tracked_services.get(&service_id) {
                Some(service) => service.callbacks.clone(),
                None => continue,
            };
            for advertisement in lost {
                let peripheral = state.peripheral_for(&advertisement);
                state.clear_gatt_advertisement(&advertisement);
                dispatches.push(Dispatch::Lost {
                    callbacks: callbacks.clone(),
                    peripheral,
                    service_id: service_id.clone(),
                    data: advertisement.data().clone(),
                    fast_advertisement: advertisement.is_fast_advertisement(),
                });
            }
        }
        drop(state);

        run_dispatches(&self.cancellation, dispatches);
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        lock_state(&self.state)
    }

    fn fetch_gatt_advertisements(
        &self,
        peripheral: Peripheral,
        header: AdvertisementHeader,
        interesting_service_ids: Vec<String>,
        fetcher: AdvertisementFetcher,
    ) {
        let state = self.state.clone();
        let clock = self.clock.clone();
        let flags = self.flags.clone();
        let cancellation = self.cancellation.clone();

        let job: Job = Box::new(move || {
            fetch_and_handle(
                &state,
                &clock,
                &flags,
                &cancellation,
                peripheral,
                header,
                interesting_service_ids,
                fetcher,
            );
        });

        match &self.worker {
            Some(worker) => {
                if let Err(job) = worker.submit(job) {
                    // Worker already shut down; degrade to inline.
                    job();
                }
            }
            None => job(),
        }
    }
}

/// A poisoned lock means a callback panicked; the maps are only mutated while
/// consistent, so keep going.
fn lock_state(state: &Arc<Mutex<TrackerState>>) -> MutexGuard<'_, TrackerState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Takes the header's read result out of the maps, runs the fetcher without
/// holding the lock, folds the outcome back in and dispatches callbacks.
fn fetch_and_handle(
    state: &Arc<Mutex<TrackerState>>,
    clock: &Arc<dyn Clock>,
    flags: &FeatureFlags,
    cancellation: &CancellationFlag,
    peripheral: Peripheral,
    header: AdvertisementHeader,
    interesting_service_ids: Vec<String>,
    fetcher: AdvertisementFetcher,
) {
    let mut read_result = {
        let mut guard = lock_state(state);
        match guard.read_results.remove(&header) {
            // Another sighting of the same header may have completed a fetch
            // while this one was queued.
            Some(result) if result.evaluate_retry() != RetryStatus::Retry => {
                guard.read_results.insert(header.clone(), result);
                guard.update_common_state(&header, &peripheral.id);
                return;
            }
            Some(result) => result,
            None => AdvertisementReadResult::new(clock.clone()),
        }
    };

    fetcher(
        &peripheral,
        header.num_slots(),
        header.psm(),
        &interesting_service_ids,
        &mut read_result,
    );
    let raw_advertisements = read_result.advertisements();

    let mut guard = lock_state(state);
    guard.read_results.insert(header.clone(), read_result);

    let mut dispatches = Vec::new();
    if !raw_advertisements.is_empty() {
        let parsed = guard.parse_raw_gatt_advertisements(&raw_advertisements);
        guard.handle_parsed_advertisements(
            flags,
            clock,
            &header,
            parsed,
            false,
            &peripheral,
            &mut dispatches,
        );
    }
    guard.update_common_state(&header, &peripheral.id);
    drop(guard);

    run_dispatches(cancellation, dispatches);
}

fn run_dispatches(cancellation: &CancellationFlag, dispatches: Vec<Dispatch>) {
    for dispatch in dispatches {
        if cancellation.is_cancelled() {
            debug!("discovery cancelled, suppressing remaining callbacks");
            return;
        }
        match dispatch {
            Dispatch::Discovered {
                callbacks,
                peripheral,
                service_id,
                data,
                fast_advertisement,
            } => {
                if let Some(cb) = &callbacks.peripheral_discovered_cb {
                    cb(peripheral, &service_id, &data, fast_advertisement);
                }
            }
            Dispatch::Lost {
                callbacks,
                peripheral,
                service_id,
                data,
                fast_advertisement,
            } => {
                if let Some(cb) = &callbacks.peripheral_lost_cb {
                    cb(peripheral, &service_id, &data, fast_advertisement);
                }
            }
            Dispatch::InstantLost {
                callbacks,
                peripheral,
                service_id,
                data,
                fast_advertisement,
            } => {
                if let Some(cb) = &callbacks.instant_lost_cb {
                    cb(peripheral, &service_id, &data, fast_advertisement);
                }
            }
            Dispatch::LegacyDevice { callbacks } => {
                if let Some(cb) = &callbacks.legacy_device_discovered_cb {
                    cb();
                }
            }
            Dispatch::DctCollision {
                callbacks,
                endpoint_id,
            } => {
                if let Some(cb) = &callbacks.dct_collision_cb {
                    cb(&endpoint_id);
                }
            }
        }
    }
}

impl TrackerState {
    fn peripheral_for(&self, advertisement: &BleAdvertisement) -> Peripheral {
        Peripheral {
            id: self
                .peripheral_ids
                .get(advertisement)
                .cloned()
                .unwrap_or_default(),
        }
    }

    /// Drops every advertisement currently associated with `service_id`.
    fn clear_data_for_service_id(&mut self, service_id: &str) {
        let advertisements: Vec<BleAdvertisement> = self
            .advertisement_services
            .iter()
            .filter(|(_, sid)| sid.as_str() == service_id)
            .map(|(advertisement, _)| advertisement.clone())
            .collect();
        for advertisement in advertisements {
            self.clear_gatt_advertisement(&advertisement);
        }
    }

    /// Removes one advertisement from every map. The owning header leaves
    /// `read_results` unconditionally (so a returning advertiser gets re-read)
    /// and leaves `parsed_advertisements` once its last advertisement is gone.
    fn clear_gatt_advertisement(&mut self, advertisement: &BleAdvertisement) {
        self.advertisement_services.remove(advertisement);
        self.advertisement_hashes.remove(advertisement);
        self.peripheral_ids.remove(advertisement);

        if let Some(header) = self.advertisement_headers.remove(advertisement) {
            if let Some(remaining) = self.parsed_advertisements.get_mut(&header) {
                remaining.remove(advertisement);
                if remaining.is_empty() {
                    self.parsed_advertisements.remove(&header);
                }
            }
            self.read_results.remove(&header);
        }
    }

    /// Step 1 of the sighting algorithm: the fast path.
    fn handle_fast_advertisement(
        &mut self,
        flags: &FeatureFlags,
        clock: &Arc<dyn Clock>,
        peripheral: &Peripheral,
        advertisement_data: &AdvertisementData,
        dispatches: &mut Vec<Dispatch>,
    ) {
        // A sighting carries at most one fast advertisement, so the first
        // tracked service whose fast UUID shows up wins.
        let hit = self
            .tracked_services
            .iter()
            .find_map(|(service_id, service)| {
                let uuid = service.fast_advertisement_service_uuid?;
                let bytes = advertisement_data.service_data.get(&uuid)?;
                Some((service_id.clone(), bytes.clone()))
            });
        let (service_id, raw) = match hit {
            Some(hit) => hit,
            None => return,
        };

        let advertisement = match BleAdvertisement::from_bytes(&raw) {
            Ok(advertisement) => advertisement,
            Err(e) => {
                debug!(
                    "undecodable fast advertisement ({}): {:?}",
                    e,
                    HexSlice(&raw[..])
                );
                return;
            }
        };

        let header = synthesized_header(&raw);
        self.read_results
            .insert(header.clone(), AdvertisementReadResult::new(clock.clone()));
        self.handle_parsed_advertisements(
            flags,
            clock,
            &header,
            vec![(service_id, advertisement, raw)],
            true,
            peripheral,
            dispatches,
        );
        self.update_common_state(&header, &peripheral.id);
    }

    /// An extended sighting carries the full advertisement in the copresence
    /// service data; no GATT read is needed.
    fn handle_extended_advertisement(
        &mut self,
        flags: &FeatureFlags,
        clock: &Arc<dyn Clock>,
        peripheral: &Peripheral,
        advertisement_data: &AdvertisementData,
        dispatches: &mut Vec<Dispatch>,
    ) {
        let raw = match advertisement_data.service_data.get(&COPRESENCE_SERVICE_UUID) {
            Some(raw) => raw.clone(),
            None => return,
        };

        let parsed = self.parse_raw_gatt_advertisements(&[raw.clone()]);
        if parsed.is_empty() {
            trace!("extended sighting with no matching advertisement");
            return;
        }

        let header = synthesized_header(&raw);
        self.read_results
            .insert(header.clone(), AdvertisementReadResult::new(clock.clone()));
        self.handle_parsed_advertisements(
            flags, clock, &header, parsed, false, peripheral, dispatches,
        );
        self.update_common_state(&header, &peripheral.id);
    }

    /// Step 2: the DCT path. Valid frames route straight to the service's
    /// found callback, keyed by endpoint id.
    fn handle_dct_advertisement(
        &mut self,
        peripheral: &Peripheral,
        advertisement_data: &AdvertisementData,
        dispatches: &mut Vec<Dispatch>,
    ) {
        let raw = match advertisement_data.service_data.get(&DCT_SERVICE_UUID) {
            Some(raw) => raw.clone(),
            None => return,
        };
        let advertisement = match DctAdvertisement::from_bytes(&raw) {
            Ok(advertisement) => advertisement,
            Err(e) => {
                debug!(
                    "undecodable DCT advertisement ({}): {:?}",
                    e,
                    HexSlice(&raw[..])
                );
                return;
            }
        };

        let endpoint_id =
            match generate_endpoint_id(advertisement.dedup(), advertisement.device_name()) {
                Ok(endpoint_id) => endpoint_id,
                Err(_) => return,
            };

        for (service_id, service) in self.tracked_services.iter_mut() {
            if !service.include_dct || !advertisement.matches_service_id(service_id) {
                continue;
            }

            let identity = (
                advertisement.device_name().to_owned(),
                advertisement.dedup(),
            );
            match service.dct_endpoints.get(&endpoint_id) {
                Some(known) if known == &identity => {} // repeat sighting
                Some(_) => dispatches.push(Dispatch::DctCollision {
                    callbacks: service.callbacks.clone(),
                    endpoint_id: endpoint_id.clone(),
                }),
                None => {
                    service
                        .dct_endpoints
                        .insert(endpoint_id.clone(), identity);
                    dispatches.push(Dispatch::Discovered {
                        callbacks: service.callbacks.clone(),
                        peripheral: peripheral.clone(),
                        service_id: service_id.clone(),
                        data: raw.clone(),
                        fast_advertisement: false,
                    });
                }
            }
        }
    }

    /// Steps 3-6: route the copresence service data. Returns the header and
    /// interesting service ids when a GATT fetch should follow.
    fn handle_advertisement_header(
        &mut self,
        flags: &FeatureFlags,
        clock: &Arc<dyn Clock>,
        peripheral: &Peripheral,
        advertisement_data: &AdvertisementData,
        dispatches: &mut Vec<Dispatch>,
    ) -> Option<(AdvertisementHeader, Vec<String>)> {
        let copresence_data = advertisement_data
            .service_data
            .get(&COPRESENCE_SERVICE_UUID);

        if let Some(bytes) = copresence_data {
            // A legacy device announcing itself with the fixed sentinel.
            if bytes.as_ref() == DUMMY_ADVERTISEMENT_BYTES {
                if flags.enable_invoking_legacy_device_discovered_cb {
                    for service in self.tracked_services.values() {
                        dispatches.push(Dispatch::LegacyDevice {
                            callbacks: service.callbacks.clone(),
                        });
                    }
                }
                return None;
            }

            // A forced-loss frame shares the copresence slot with headers.
            if let Ok(loss) = InstantLossAdvertisement::from_bytes(bytes) {
                self.handle_forced_loss(flags, clock, &loss, dispatches);
                return None;
            }
        }

        // A valid header lives in the service data (Android), base64 in the
        // local name (iOS), or is synthesized so the peripheral's GATT server
        // still gets a look.
        let header_bytes: Bytes = match copresence_data {
            Some(bytes) => bytes.clone(),
            None => match &advertisement_data.local_name {
                Some(name) => match URL_SAFE_NO_PAD.decode(name) {
                    Ok(decoded) => decoded.into(),
                    Err(_) => Bytes::copy_from_slice(name.as_bytes()),
                },
                None => self.dummy_header_bytes(peripheral),
            },
        };

        let header = match AdvertisementHeader::from_bytes(&header_bytes) {
            Ok(header) if header.is_valid() => header,
            Ok(_) => {
                trace!("dropping non-v2 advertisement header");
                return None;
            }
            Err(e) => {
                debug!(
                    "undecodable advertisement header ({}): {:?}",
                    e,
                    HexSlice(&header_bytes[..])
                );
                return None;
            }
        };

        // Step 5: only headers that may contain a tracked service id are
        // worth a read.
        let bloom = header.service_id_bloom_filter();
        let interesting_service_ids: Vec<String> = self
            .tracked_services
            .keys()
            .filter(|service_id| bloom.possibly_contains(service_id))
            .cloned()
            .collect();
        if interesting_service_ids.is_empty() {
            trace!("advertisement header matches no tracked service id");
            return None;
        }

        // Without Classic scanning, an interesting BLE header is the only
        // evidence of a nearby legacy device.
        if flags.disable_bluetooth_classic_scanning {
            for service_id in &interesting_service_ids {
                if let Some(service) = self.tracked_services.get(service_id) {
                    dispatches.push(Dispatch::LegacyDevice {
                        callbacks: service.callbacks.clone(),
                    });
                }
            }
        }

        if !self.should_fetch_gatt(flags, clock, &header) {
            // The maps are already up to date for this header; refresh the
            // lost-tracker rounds so known advertisements stay alive.
            self.update_common_state(&header, &peripheral.id);
            return None;
        }
        Some((header, interesting_service_ids))
    }

    /// Step 6: the GATT retry decision, including the deferral window for
    /// extended-capable headers.
    fn should_fetch_gatt(
        &mut self,
        flags: &FeatureFlags,
        clock: &Arc<dyn Clock>,
        header: &AdvertisementHeader,
    ) -> bool {
        if flags.enable_read_gatt_for_extended_advertisement
            && header.supports_extended_advertisement()
        {
            let now = clock.now();
            match self.extended_pending.get(header) {
                None => {
                    self.extended_pending.insert(header.clone(), now);
                    return false;
                }
                Some(&first_seen) => {
                    let elapsed = now - first_seen;
                    if elapsed > EXTENDED_PENDING_EXPIRY {
                        self.extended_pending.insert(header.clone(), now);
                        return false;
                    }
                    if elapsed < EXTENDED_READ_DELAY {
                        return false;
                    }
                    self.extended_pending.remove(header);
                }
            }
        }

        match self.read_results.get(header) {
            // Never seen this header: always read.
            None => true,
            Some(result) => match result.evaluate_retry() {
                RetryStatus::Retry => true,
                RetryStatus::PreviouslySucceeded | RetryStatus::TooSoon => false,
            },
        }
    }

    /// Step 7: parse raw GATT payloads and match them to tracked services by
    /// service-id hash; the highest advertisement version wins per service.
    fn parse_raw_gatt_advertisements(
        &self,
        raw_advertisements: &[Bytes],
    ) -> Vec<(String, BleAdvertisement, Bytes)> {
        let mut matched: HashMap<String, (BleAdvertisement, Bytes)> = HashMap::new();

        for raw in raw_advertisements {
            let advertisement = match BleAdvertisement::from_bytes(raw) {
                Ok(advertisement) => advertisement,
                Err(e) => {
                    debug!(
                        "undecodable GATT advertisement ({}): {:?}",
                        e,
                        HexSlice(&raw[..])
                    );
                    continue;
                }
            };

            for service_id in self.tracked_services.keys() {
                if let Some((existing, _)) = matched.get(service_id) {
                    if u8::from(existing.version()) > u8::from(advertisement.version()) {
                        continue;
                    }
                }
                if service_id_hash(service_id) == *advertisement.service_id_hash() {
                    matched.insert(service_id.clone(), (advertisement.clone(), raw.clone()));
                    break;
                }
            }
        }

        matched
            .into_iter()
            .map(|(service_id, (advertisement, raw))| (service_id, advertisement, raw))
            .collect()
    }

    /// Steps 8-9: fold newly associated advertisements into the maps and
    /// queue found callbacks, exactly once per (service, advertisement).
    fn handle_parsed_advertisements(
        &mut self,
        flags: &FeatureFlags,
        clock: &Arc<dyn Clock>,
        header: &AdvertisementHeader,
        parsed: Vec<(String, BleAdvertisement, Bytes)>,
        fast_advertisement: bool,
        peripheral: &Peripheral,
        dispatches: &mut Vec<Dispatch>,
    ) {
        let mut values = HashSet::new();

        for (service_id, advertisement, raw) in parsed {
            let hash = advertisement_hash(&raw);
            if flags.enable_instant_on_lost && self.is_blocklisted(clock, &hash) {
                debug!("suppressing rediscovery of a force-lost advertisement");
                continue;
            }
            values.insert(advertisement.clone());

            match self.advertisement_headers.get(&advertisement) {
                None => {
                    if let Some(service) = self.tracked_services.get(&service_id) {
                        dispatches.push(Dispatch::Discovered {
                            callbacks: service.callbacks.clone(),
                            peripheral: peripheral.clone(),
                            service_id: service_id.clone(),
                            data: advertisement.data().clone(),
                            fast_advertisement,
                        });
                    }
                }
                Some(old_header) if old_header != header => {
                    // The advertiser moved to a new header; the old one is
                    // dead weight.
                    let old_header = old_header.clone();
                    self.read_results.remove(&old_header);
                    self.parsed_advertisements.remove(&old_header);
                }
                Some(_) => {}
            }

            self.advertisement_headers
                .insert(advertisement.clone(), header.clone());
            self.advertisement_services
                .insert(advertisement.clone(), service_id);
            self.advertisement_hashes.insert(advertisement, hash);
        }

        if !values.is_empty() {
            self.parsed_advertisements
                .entry(header.clone())
                .or_insert_with(HashSet::new)
                .extend(values);
        }
    }

    /// Post-sighting housekeeping: record every advertisement still under
    /// this header as found and remember the peripheral it came from.
    fn update_common_state(&mut self, header: &AdvertisementHeader, peripheral_id: &str) {
        let advertisements = match self.parsed_advertisements.get(header) {
            Some(advertisements) => advertisements.clone(),
            None => return,
        };

        for advertisement in advertisements {
            let service_id = match self.advertisement_services.get(&advertisement) {
                Some(service_id) => service_id.clone(),
                None => continue,
            };
            if !self.tracked_services.contains_key(&service_id) {
                continue;
            }
            if let Some(tracker) = self.lost_trackers.get_mut(&service_id) {
                tracker.record_found(advertisement.clone());
            }
            self.peripheral_ids
                .insert(advertisement, peripheral_id.to_owned());
        }
    }

    /// The forced-loss path: match the frame's hashes against every tracked
    /// advertisement.
    fn handle_forced_loss(
        &mut self,
        flags: &FeatureFlags,
        clock: &Arc<dyn Clock>,
        loss: &InstantLossAdvertisement,
        dispatches: &mut Vec<Dispatch>,
    ) {
        for hash in loss.hashes() {
            let matching: Vec<BleAdvertisement> = self
                .advertisement_hashes
                .iter()
                .filter(|(_, known)| *known == hash)
                .map(|(advertisement, _)| advertisement.clone())
                .collect();

            for advertisement in matching {
                let service_id = match self.advertisement_services.get(&advertisement) {
                    Some(service_id) => service_id.clone(),
                    None => continue,
                };

                if flags.enable_instant_on_lost {
                    self.lost_hash_blocklist.insert(hash.clone(), clock.now());
                    if let Some(tracker) = self.lost_trackers.get_mut(&service_id) {
                        tracker.forget(&advertisement);
                    }
                    let peripheral = self.peripheral_for(&advertisement);
                    self.clear_gatt_advertisement(&advertisement);
                    if let Some(service) = self.tracked_services.get(&service_id) {
                        dispatches.push(Dispatch::InstantLost {
                            callbacks: service.callbacks.clone(),
                            peripheral,
                            service_id,
                            data: advertisement.data().clone(),
                            fast_advertisement: advertisement.is_fast_advertisement(),
                        });
                    }
                } else {
                    // Reported by the next sweep.
                    self.forced_lost
                        .entry(service_id)
                        .or_insert_with(HashSet::new)
                        .insert(advertisement);
                }
            }
        }
    }

    fn is_blocklisted(&mut self, clock: &Arc<dyn Clock>, hash: &Bytes) -> bool {
        let now = clock.now();
        self.lost_hash_blocklist
            .retain(|_, lost_at| now - *lost_at <= LOST_HASH_EXPIRY);
        self.lost_hash_blocklist.contains_key(hash)
    }

    /// Builds header bytes whose bloom filter contains every tracked service
    /// id, for peripherals that advertise neither service data nor a local
    /// name. The interest check passes and the GATT server gets a look.
    fn dummy_header_bytes(&self, peripheral: &Peripheral) -> Bytes {
        let mut bloom = BloomFilter::new();
        for service_id in self.tracked_services.keys() {
            bloom.add(service_id);
        }

        AdvertisementHeader::new(
            HeaderVersion::V2,
            false,
            MAX_SLOTS_FALLBACK,
            &bloom,
            advertisement_hash(peripheral.id.as_bytes()),
            None,
        )
        .and_then(|header| header.to_bytes())
        .unwrap_or_else(|_| Bytes::new())
    }
}

/// Builds the header under which a self-contained advertisement (fast or
/// extended) is tracked: an empty bloom filter and the hash of the raw bytes.
fn synthesized_header(raw: &Bytes) -> AdvertisementHeader {
    AdvertisementHeader::new(
        HeaderVersion::V2,
        false,
        1,
        &BloomFilter::new(),
        advertisement_hash(raw),
        None,
    )
    .unwrap_or_else(|_| unreachable!("fixed-size synthesized header"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adv::legacy::{SocketVersion, Version};
    use crate::time::FakeClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::RecvTimeoutError;
    use std::time::Duration as StdDuration;

    const SERVICE_A: &str = "A";
    const SERVICE_B: &str = "B";
    const DATA: &[u8] = &[0x04, 0x02, 0x00];
    const TOKEN: &[u8] = &[0x04, 0x20];
    const FAST_UUID: Uuid128 = Uuid128::parse_static("0000fe2c-0000-1000-8000-00805f9b34fb");

    #[derive(Clone, Default)]
    struct Events {
        found: Arc<Mutex<Vec<(String, Bytes, bool)>>>,
        lost: Arc<Mutex<Vec<(String, Bytes)>>>,
        instant_lost: Arc<Mutex<Vec<(String, Bytes)>>>,
        legacy: Arc<AtomicUsize>,
        dct_collisions: Arc<Mutex<Vec<String>>>,
    }

    impl Events {
        fn callbacks(&self) -> DiscoveryCallbacks {
            let found = self.found.clone();
            let lost = self.lost.clone();
            let instant = self.instant_lost.clone();
            let legacy = self.legacy.clone();
            let collisions = self.dct_collisions.clone();
            DiscoveryCallbacks {
                peripheral_discovered_cb: Some(Box::new(move |_, service_id, data, fast| {
                    found
                        .lock()
                        .unwrap()
                        .push((service_id.to_owned(), data.clone(), fast));
                })),
                peripheral_lost_cb: Some(Box::new(move |_, service_id, data, _| {
                    lost.lock().unwrap().push((service_id.to_owned(), data.clone()));
                })),
                instant_lost_cb: Some(Box::new(move |_, service_id, data, _| {
                    instant
                        .lock()
                        .unwrap()
                        .push((service_id.to_owned(), data.clone()));
                })),
                legacy_device_discovered_cb: Some(Box::new(move || {
                    legacy.fetch_add(1, Ordering::SeqCst);
                })),
                dct_collision_cb: Some(Box::new(move |endpoint_id| {
                    collisions.lock().unwrap().push(endpoint_id.to_owned());
                })),
            }
        }

        fn found(&self) -> Vec<(String, Bytes, bool)> {
            self.found.lock().unwrap().clone()
        }

        fn lost(&self) -> Vec<(String, Bytes)> {
            self.lost.lock().unwrap().clone()
        }

        fn instant_lost(&self) -> Vec<(String, Bytes)> {
            self.instant_lost.lock().unwrap().clone()
        }
    }

    fn inline_flags() -> FeatureFlags {
        FeatureFlags {
            enable_gatt_query_in_thread: false,
            ..FeatureFlags::default()
        }
    }

    fn tracker_with(flags: FeatureFlags) -> (DiscoveredPeripheralTracker, FakeClock) {
        let clock = FakeClock::new();
        let tracker = DiscoveredPeripheralTracker::with_clock(
            flags,
            Arc::new(clock.clone()),
            CancellationFlag::new(),
        );
        (tracker, clock)
    }

    fn peripheral() -> Peripheral {
        Peripheral {
            id: "11:22:33:44:55:66".to_owned(),
        }
    }

    fn fast_advertisement_bytes() -> Bytes {
        BleAdvertisement::new_fast(
            Version::V2,
            SocketVersion::V2,
            Bytes::from_static(DATA),
            Bytes::from_static(TOKEN),
        )
        .unwrap()
        .to_bytes()
        .unwrap()
    }

    fn gatt_advertisement_bytes(service_id: &str) -> Bytes {
        BleAdvertisement::new(
            Version::V2,
            SocketVersion::V2,
            service_id_hash(service_id),
            Bytes::from_static(DATA),
            Bytes::from_static(TOKEN),
            None,
        )
        .unwrap()
        .to_bytes()
        .unwrap()
    }

    fn header_bytes(service_ids: &[&str], hash_seed: &[u8], extended: bool) -> Bytes {
        let mut bloom = BloomFilter::new();
        for service_id in service_ids {
            bloom.add(service_id);
        }
        AdvertisementHeader::new(
            HeaderVersion::V2,
            extended,
            service_ids.len() as u8,
            &bloom,
            advertisement_hash(hash_seed),
            None,
        )
        .unwrap()
        .to_bytes()
        .unwrap()
    }

    fn sighting(entries: &[(Uuid128, Bytes)]) -> AdvertisementData {
        AdvertisementData {
            local_name: None,
            service_data: entries.iter().cloned().collect(),
            is_extended_advertisement: false,
        }
    }

    fn counting_fetcher(
        count: Arc<AtomicUsize>,
        advertisements: Vec<Bytes>,
        success: bool,
    ) -> AdvertisementFetcher {
        Box::new(move |_, _, _, _, read_result| {
            count.fetch_add(1, Ordering::SeqCst);
            for (slot, advertisement) in advertisements.iter().enumerate() {
                read_result.add_advertisement(slot as u8, advertisement.clone());
            }
            read_result.record_last_read_status(success);
        })
    }

    #[test]
    fn fast_advertisement_discovered_without_gatt_read() {
        let (tracker, _clock) = tracker_with(inline_flags());
        let events = Events::default();
        let fetches = Arc::new(AtomicUsize::new(0));

        tracker.start_tracking(
            SERVICE_A,
            false,
            Pcp::P2pPointToPoint,
            events.callbacks(),
            Some(FAST_UUID),
        );
        tracker.process_found(
            peripheral(),
            sighting(&[(FAST_UUID, fast_advertisement_bytes())]),
            counting_fetcher(fetches.clone(), vec![], true),
        );

        let found = events.found();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, SERVICE_A);
        assert_eq!(found[0].1.as_ref(), DATA);
        assert!(found[0].2, "fast advertisement flag");
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn duplicate_fast_sightings_reported_once() {
        let (tracker, _clock) = tracker_with(inline_flags());
        let events = Events::default();
        let fetches = Arc::new(AtomicUsize::new(0));

        tracker.start_tracking(
            SERVICE_A,
            false,
            Pcp::P2pPointToPoint,
            events.callbacks(),
            Some(FAST_UUID),
        );
        for _ in 0..3 {
            tracker.process_found(
                peripheral(),
                sighting(&[(FAST_UUID, fast_advertisement_bytes())]),
                counting_fetcher(fetches.clone(), vec![], true),
            );
        }

        assert_eq!(events.found().len(), 1);
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn fast_advertisement_under_untracked_uuid_ignored() {
        let (tracker, _clock) = tracker_with(inline_flags());
        let events = Events::default();
        let fetches = Arc::new(AtomicUsize::new(0));

        let other_uuid = Uuid128::parse_static("0000fe3c-0000-1000-8000-00805f9b34fb");
        tracker.start_tracking(
            SERVICE_A,
            false,
            Pcp::P2pPointToPoint,
            events.callbacks(),
            Some(other_uuid),
        );
        tracker.process_found(
            peripheral(),
            sighting(&[(FAST_UUID, fast_advertisement_bytes())]),
            counting_fetcher(fetches.clone(), vec![], true),
        );

        assert!(events.found().is_empty());
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dct_sighting_discovered_without_gatt_read() {
        let (tracker, _clock) = tracker_with(inline_flags());
        let events = Events::default();
        let fetches = Arc::new(AtomicUsize::new(0));

        let dct = DctAdvertisement::new(SERVICE_A, "device", 0xF100, 0x01)
            .unwrap()
            .to_bytes()
            .unwrap();

        tracker.start_tracking(
            SERVICE_A,
            true,
            Pcp::P2pPointToPoint,
            events.callbacks(),
            Some(FAST_UUID),
        );
        tracker.process_found(
            peripheral(),
            sighting(&[(DCT_SERVICE_UUID, dct.clone())]),
            counting_fetcher(fetches.clone(), vec![], true),
        );
        // A repeat sighting of the same endpoint is dropped.
        tracker.process_found(
            peripheral(),
            sighting(&[(DCT_SERVICE_UUID, dct)]),
            counting_fetcher(fetches.clone(), vec![], true),
        );

        let found = events.found();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, SERVICE_A);
        assert!(!found[0].2, "DCT discoveries are not fast advertisements");
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn gatt_sighting_then_sweeps_reports_lost() {
        let (tracker, _clock) = tracker_with(inline_flags());
        let events = Events::default();
        let fetches = Arc::new(AtomicUsize::new(0));
        let advertisement = gatt_advertisement_bytes(SERVICE_A);

        tracker.start_tracking(
            SERVICE_A,
            false,
            Pcp::P2pPointToPoint,
            events.callbacks(),
            None,
        );
        tracker.process_found(
            peripheral(),
            sighting(&[(COPRESENCE_SERVICE_UUID, header_bytes(&[SERVICE_A], b"seed", false))]),
            counting_fetcher(fetches.clone(), vec![advertisement], true),
        );

        let found = events.found();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1.as_ref(), DATA);
        assert!(!found[0].2);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        // First sweep: grace period. Second sweep: lost.
        tracker.process_lost_gatt_advertisements();
        assert!(events.lost().is_empty());
        tracker.process_lost_gatt_advertisements();
        let lost = events.lost();
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].0, SERVICE_A);
        assert_eq!(lost[0].1.as_ref(), DATA);

        // Only reported once.
        tracker.process_lost_gatt_advertisements();
        assert_eq!(events.lost().len(), 1);
    }

    #[test]
    fn resighting_keeps_peripheral_alive_without_refetch() {
        let (tracker, _clock) = tracker_with(inline_flags());
        let events = Events::default();
        let fetches = Arc::new(AtomicUsize::new(0));
        let header = header_bytes(&[SERVICE_A], b"seed", false);

        tracker.start_tracking(
            SERVICE_A,
            false,
            Pcp::P2pPointToPoint,
            events.callbacks(),
            None,
        );
        for _ in 0..4 {
            tracker.process_found(
                peripheral(),
                sighting(&[(COPRESENCE_SERVICE_UUID, header.clone())]),
                counting_fetcher(
                    fetches.clone(),
                    vec![gatt_advertisement_bytes(SERVICE_A)],
                    true,
                ),
            );
            tracker.process_lost_gatt_advertisements();
        }

        assert_eq!(events.found().len(), 1);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert!(events.lost().is_empty());
    }

    #[test]
    fn uninteresting_header_not_fetched() {
        let (tracker, _clock) = tracker_with(inline_flags());
        let events = Events::default();
        let fetches = Arc::new(AtomicUsize::new(0));

        tracker.start_tracking(
            SERVICE_A,
            false,
            Pcp::P2pPointToPoint,
            events.callbacks(),
            None,
        );
        tracker.process_found(
            peripheral(),
            sighting(&[(COPRESENCE_SERVICE_UUID, header_bytes(&[SERVICE_B], b"seed", false))]),
            counting_fetcher(fetches.clone(), vec![gatt_advertisement_bytes(SERVICE_B)], true),
        );

        assert!(events.found().is_empty());
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_fetches_back_off_exponentially() {
        let (tracker, clock) = tracker_with(inline_flags());
        let events = Events::default();
        let fetches = Arc::new(AtomicUsize::new(0));
        let header = header_bytes(&[SERVICE_A], b"seed", false);

        tracker.start_tracking(
            SERVICE_A,
            false,
            Pcp::P2pPointToPoint,
            events.callbacks(),
            None,
        );

        let sight = |expected_fetches: usize| {
            tracker.process_found(
                peripheral(),
                sighting(&[(COPRESENCE_SERVICE_UUID, header.clone())]),
                counting_fetcher(fetches.clone(), vec![], false),
            );
            assert_eq!(fetches.load(Ordering::SeqCst), expected_fetches);
        };

        sight(1);
        // Within the 1 s base window: no fetch.
        sight(1);
        clock.advance(Duration::from_secs(1));
        sight(2);
        // The window doubled to 2 s.
        clock.advance(Duration::from_secs(1));
        sight(2);
        clock.advance(Duration::from_secs(1));
        sight(3);

        assert!(events.found().is_empty());
    }

    #[test]
    fn forced_loss_reported_on_next_sweep() {
        let (tracker, _clock) = tracker_with(inline_flags());
        let events = Events::default();
        let fetches = Arc::new(AtomicUsize::new(0));
        let advertisement = gatt_advertisement_bytes(SERVICE_A);

        tracker.start_tracking(
            SERVICE_A,
            false,
            Pcp::P2pPointToPoint,
            events.callbacks(),
            None,
        );
        tracker.process_found(
            peripheral(),
            sighting(&[(COPRESENCE_SERVICE_UUID, header_bytes(&[SERVICE_A], b"seed", false))]),
            counting_fetcher(fetches.clone(), vec![advertisement.clone()], true),
        );
        assert_eq!(events.found().len(), 1);

        let loss = InstantLossAdvertisement::from_hashes(vec![advertisement_hash(&advertisement)])
            .unwrap()
            .to_bytes()
            .unwrap();
        tracker.process_found(
            peripheral(),
            sighting(&[(COPRESENCE_SERVICE_UUID, loss)]),
            counting_fetcher(fetches.clone(), vec![], true),
        );

        // No extra fetch for the loss frame, and the loss lands on the very
        // next sweep instead of waiting out the grace period.
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert!(events.lost().is_empty());
        tracker.process_lost_gatt_advertisements();
        assert_eq!(events.lost().len(), 1);
        assert!(events.instant_lost().is_empty());
    }

    #[test]
    fn instant_on_lost_fires_immediately_and_blocks_rediscovery() {
        let flags = FeatureFlags {
            enable_instant_on_lost: true,
            ..inline_flags()
        };
        let (tracker, _clock) = tracker_with(flags);
        let events = Events::default();
        let fetches = Arc::new(AtomicUsize::new(0));
        let advertisement = gatt_advertisement_bytes(SERVICE_A);
        let header = header_bytes(&[SERVICE_A], b"seed", false);

        tracker.start_tracking(
            SERVICE_A,
            false,
            Pcp::P2pPointToPoint,
            events.callbacks(),
            None,
        );
        tracker.process_found(
            peripheral(),
            sighting(&[(COPRESENCE_SERVICE_UUID, header.clone())]),
            counting_fetcher(fetches.clone(), vec![advertisement.clone()], true),
        );
        assert_eq!(events.found().len(), 1);

        let loss = InstantLossAdvertisement::from_hashes(vec![advertisement_hash(&advertisement)])
            .unwrap()
            .to_bytes()
            .unwrap();
        tracker.process_found(
            peripheral(),
            sighting(&[(COPRESENCE_SERVICE_UUID, loss)]),
            counting_fetcher(fetches.clone(), vec![], true),
        );

        assert_eq!(events.instant_lost().len(), 1);
        assert!(events.lost().is_empty());

        // The identical sighting is re-fetched (its read result was evicted)
        // but the blocklisted advertisement is not re-reported.
        tracker.process_found(
            peripheral(),
            sighting(&[(COPRESENCE_SERVICE_UUID, header)]),
            counting_fetcher(fetches.clone(), vec![advertisement], true),
        );
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
        assert_eq!(events.found().len(), 1);

        // The sweep has nothing left to report.
        tracker.process_lost_gatt_advertisements();
        tracker.process_lost_gatt_advertisements();
        assert!(events.lost().is_empty());
    }

    #[test]
    fn duplicate_across_extended_and_gatt_paths_reported_once() {
        let (tracker, _clock) = tracker_with(inline_flags());
        let events = Events::default();
        let fetches = Arc::new(AtomicUsize::new(0));
        let advertisement = gatt_advertisement_bytes(SERVICE_A);

        tracker.start_tracking(
            SERVICE_A,
            false,
            Pcp::P2pPointToPoint,
            events.callbacks(),
            None,
        );

        // Sighting A: the advertisement arrives self-contained over extended
        // advertising.
        let mut extended = sighting(&[(COPRESENCE_SERVICE_UUID, advertisement.clone())]);
        extended.is_extended_advertisement = true;
        tracker.process_found(
            peripheral(),
            extended,
            counting_fetcher(fetches.clone(), vec![], true),
        );

        let found = events.found();
        assert_eq!(found.len(), 1);
        assert!(!found[0].2);
        assert_eq!(fetches.load(Ordering::SeqCst), 0);

        // Sighting B: the same advertisement behind a GATT header. The fetch
        // happens, the duplicate callback does not.
        tracker.process_found(
            peripheral(),
            sighting(&[(COPRESENCE_SERVICE_UUID, header_bytes(&[SERVICE_A], b"seed", false))]),
            counting_fetcher(fetches.clone(), vec![advertisement], true),
        );
        assert_eq!(events.found().len(), 1);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lost_peripheral_can_be_rediscovered() {
        let (tracker, _clock) = tracker_with(inline_flags());
        let events = Events::default();
        let fetches = Arc::new(AtomicUsize::new(0));
        let header = header_bytes(&[SERVICE_A], b"seed", false);

        tracker.start_tracking(
            SERVICE_A,
            false,
            Pcp::P2pPointToPoint,
            events.callbacks(),
            None,
        );
        tracker.process_found(
            peripheral(),
            sighting(&[(COPRESENCE_SERVICE_UUID, header.clone())]),
            counting_fetcher(fetches.clone(), vec![gatt_advertisement_bytes(SERVICE_A)], true),
        );
        tracker.process_lost_gatt_advertisements();
        tracker.process_lost_gatt_advertisements();
        assert_eq!(events.lost().len(), 1);

        // The eviction dropped the read result, so the advertiser's return
        // triggers a fresh read and a fresh discovery.
        tracker.process_found(
            peripheral(),
            sighting(&[(COPRESENCE_SERVICE_UUID, header)]),
            counting_fetcher(fetches.clone(), vec![gatt_advertisement_bytes(SERVICE_A)], true),
        );
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
        assert_eq!(events.found().len(), 2);
    }

    #[test]
    fn stop_tracking_suppresses_lost_callbacks() {
        let (tracker, _clock) = tracker_with(inline_flags());
        let events = Events::default();
        let fetches = Arc::new(AtomicUsize::new(0));

        tracker.start_tracking(
            SERVICE_A,
            false,
            Pcp::P2pPointToPoint,
            events.callbacks(),
            None,
        );
        tracker.process_found(
            peripheral(),
            sighting(&[(COPRESENCE_SERVICE_UUID, header_bytes(&[SERVICE_A], b"seed", false))]),
            counting_fetcher(fetches.clone(), vec![gatt_advertisement_bytes(SERVICE_A)], true),
        );
        assert_eq!(events.found().len(), 1);

        tracker.stop_tracking(SERVICE_A);
        tracker.process_lost_gatt_advertisements();
        tracker.process_lost_gatt_advertisements();
        assert!(events.lost().is_empty());
    }

    #[test]
    fn dummy_advertisement_reports_legacy_device() {
        let (tracker, _clock) = tracker_with(inline_flags());
        let events = Events::default();
        let fetches = Arc::new(AtomicUsize::new(0));

        tracker.start_tracking(
            SERVICE_A,
            false,
            Pcp::P2pPointToPoint,
            events.callbacks(),
            None,
        );
        tracker.process_found(
            peripheral(),
            sighting(&[(
                COPRESENCE_SERVICE_UUID,
                Bytes::from_static(DUMMY_ADVERTISEMENT_BYTES),
            )]),
            counting_fetcher(fetches.clone(), vec![], true),
        );

        assert_eq!(events.legacy.load(Ordering::SeqCst), 1);
        assert!(events.found().is_empty());
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dummy_advertisement_dropped_when_flag_off() {
        let flags = FeatureFlags {
            enable_invoking_legacy_device_discovered_cb: false,
            ..inline_flags()
        };
        let (tracker, _clock) = tracker_with(flags);
        let events = Events::default();
        let fetches = Arc::new(AtomicUsize::new(0));

        tracker.start_tracking(
            SERVICE_A,
            false,
            Pcp::P2pPointToPoint,
            events.callbacks(),
            None,
        );
        tracker.process_found(
            peripheral(),
            sighting(&[(
                COPRESENCE_SERVICE_UUID,
                Bytes::from_static(DUMMY_ADVERTISEMENT_BYTES),
            )]),
            counting_fetcher(fetches.clone(), vec![], true),
        );

        assert_eq!(events.legacy.load(Ordering::SeqCst), 0);
        assert!(events.found().is_empty());
    }

    #[test]
    fn interesting_header_reports_legacy_device_without_classic_scanning() {
        let flags = FeatureFlags {
            disable_bluetooth_classic_scanning: true,
            ..inline_flags()
        };
        let (tracker, _clock) = tracker_with(flags);
        let events = Events::default();
        let fetches = Arc::new(AtomicUsize::new(0));

        tracker.start_tracking(
            SERVICE_A,
            false,
            Pcp::P2pPointToPoint,
            events.callbacks(),
            None,
        );
        tracker.process_found(
            peripheral(),
            sighting(&[(COPRESENCE_SERVICE_UUID, header_bytes(&[SERVICE_A], b"seed", false))]),
            counting_fetcher(fetches.clone(), vec![gatt_advertisement_bytes(SERVICE_A)], true),
        );

        assert_eq!(events.legacy.load(Ordering::SeqCst), 1);
        assert_eq!(events.found().len(), 1);
    }

    #[test]
    fn extended_capable_header_defers_gatt_read() {
        let flags = FeatureFlags {
            enable_read_gatt_for_extended_advertisement: true,
            ..inline_flags()
        };
        let (tracker, clock) = tracker_with(flags);
        let events = Events::default();
        let fetches = Arc::new(AtomicUsize::new(0));
        let header = header_bytes(&[SERVICE_A], b"seed", true);

        tracker.start_tracking(
            SERVICE_A,
            false,
            Pcp::P2pPointToPoint,
            events.callbacks(),
            None,
        );

        // First sighting: deferred, waiting for the extended advertisement.
        tracker.process_found(
            peripheral(),
            sighting(&[(COPRESENCE_SERVICE_UUID, header.clone())]),
            counting_fetcher(fetches.clone(), vec![gatt_advertisement_bytes(SERVICE_A)], true),
        );
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
        assert!(events.found().is_empty());

        // Still inside the deferral window: no read.
        tracker.process_found(
            peripheral(),
            sighting(&[(COPRESENCE_SERVICE_UUID, header.clone())]),
            counting_fetcher(fetches.clone(), vec![gatt_advertisement_bytes(SERVICE_A)], true),
        );
        assert_eq!(fetches.load(Ordering::SeqCst), 0);

        // After 4 s without the extended advertisement, read after all.
        clock.advance(EXTENDED_READ_DELAY);
        tracker.process_found(
            peripheral(),
            sighting(&[(COPRESENCE_SERVICE_UUID, header)]),
            counting_fetcher(fetches.clone(), vec![gatt_advertisement_bytes(SERVICE_A)], true),
        );
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(events.found().len(), 1);
    }

    #[test]
    fn cancellation_suppresses_callbacks() {
        let clock = FakeClock::new();
        let cancellation = CancellationFlag::new();
        let tracker = DiscoveredPeripheralTracker::with_clock(
            inline_flags(),
            Arc::new(clock),
            cancellation.clone(),
        );
        let events = Events::default();
        let fetches = Arc::new(AtomicUsize::new(0));

        tracker.start_tracking(
            SERVICE_A,
            false,
            Pcp::P2pPointToPoint,
            events.callbacks(),
            None,
        );
        cancellation.cancel();
        tracker.process_found(
            peripheral(),
            sighting(&[(COPRESENCE_SERVICE_UUID, header_bytes(&[SERVICE_A], b"seed", false))]),
            counting_fetcher(fetches.clone(), vec![gatt_advertisement_bytes(SERVICE_A)], true),
        );

        assert!(events.found().is_empty());
    }

    #[test]
    fn header_in_local_name_discovers() {
        let (tracker, _clock) = tracker_with(inline_flags());
        let events = Events::default();
        let fetches = Arc::new(AtomicUsize::new(0));

        tracker.start_tracking(
            SERVICE_A,
            false,
            Pcp::P2pPointToPoint,
            events.callbacks(),
            None,
        );
        let data = AdvertisementData {
            local_name: Some(URL_SAFE_NO_PAD.encode(header_bytes(&[SERVICE_A], b"seed", false))),
            service_data: HashMap::new(),
            is_extended_advertisement: false,
        };
        tracker.process_found(
            peripheral(),
            data,
            counting_fetcher(fetches.clone(), vec![gatt_advertisement_bytes(SERVICE_A)], true),
        );

        assert_eq!(events.found().len(), 1);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bare_sighting_gets_a_synthesized_header() {
        let (tracker, _clock) = tracker_with(inline_flags());
        let events = Events::default();
        let fetches = Arc::new(AtomicUsize::new(0));

        tracker.start_tracking(
            SERVICE_A,
            false,
            Pcp::P2pPointToPoint,
            events.callbacks(),
            None,
        );
        // Neither service data nor a local name: the tracker still gives the
        // peripheral's GATT server a look.
        tracker.process_found(
            peripheral(),
            AdvertisementData::default(),
            counting_fetcher(fetches.clone(), vec![gatt_advertisement_bytes(SERVICE_A)], true),
        );

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(events.found().len(), 1);
    }

    #[test]
    fn fast_and_gatt_advertisements_in_one_sighting() {
        let (tracker, _clock) = tracker_with(inline_flags());
        let events_a = Events::default();
        let events_b = Events::default();
        let fetches = Arc::new(AtomicUsize::new(0));

        tracker.start_tracking(
            SERVICE_A,
            false,
            Pcp::P2pPointToPoint,
            events_a.callbacks(),
            Some(FAST_UUID),
        );
        tracker.start_tracking(
            SERVICE_B,
            false,
            Pcp::P2pPointToPoint,
            events_b.callbacks(),
            None,
        );

        tracker.process_found(
            peripheral(),
            sighting(&[
                (FAST_UUID, fast_advertisement_bytes()),
                (COPRESENCE_SERVICE_UUID, header_bytes(&[SERVICE_B], b"seed", false)),
            ]),
            counting_fetcher(fetches.clone(), vec![gatt_advertisement_bytes(SERVICE_B)], true),
        );

        let found_a = events_a.found();
        assert_eq!(found_a.len(), 1);
        assert!(found_a[0].2);
        let found_b = events_b.found();
        assert_eq!(found_b.len(), 1);
        assert!(!found_b[0].2);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn advertiser_moving_to_a_new_header_is_not_rediscovered() {
        let (tracker, _clock) = tracker_with(inline_flags());
        let events = Events::default();
        let fetches = Arc::new(AtomicUsize::new(0));
        let advertisement = gatt_advertisement_bytes(SERVICE_A);

        tracker.start_tracking(
            SERVICE_A,
            false,
            Pcp::P2pPointToPoint,
            events.callbacks(),
            None,
        );
        tracker.process_found(
            peripheral(),
            sighting(&[(COPRESENCE_SERVICE_UUID, header_bytes(&[SERVICE_A], b"old", false))]),
            counting_fetcher(fetches.clone(), vec![advertisement.clone()], true),
        );
        tracker.process_found(
            peripheral(),
            sighting(&[(COPRESENCE_SERVICE_UUID, header_bytes(&[SERVICE_A], b"new", false))]),
            counting_fetcher(fetches.clone(), vec![advertisement], true),
        );

        assert_eq!(fetches.load(Ordering::SeqCst), 2);
        assert_eq!(events.found().len(), 1);

        // The advertisement stays tracked under the new header only.
        tracker.process_lost_gatt_advertisements();
        tracker.process_lost_gatt_advertisements();
        assert_eq!(events.lost().len(), 1);
    }

    #[test]
    fn dct_endpoint_id_collision_reported() {
        // Hunt for two device names whose 4-character endpoint ids collide.
        let mut seen: HashMap<String, String> = HashMap::new();
        let mut pair = None;
        for i in 0..200_000 {
            let name = format!("n{}", i);
            let endpoint_id = generate_endpoint_id(0x01, &name).unwrap();
            if let Some(other) = seen.get(&endpoint_id) {
                pair = Some((other.clone(), name));
                break;
            }
            seen.insert(endpoint_id, name);
        }
        let (first, second) = pair.expect("endpoint id space is only 36^4");

        let (tracker, _clock) = tracker_with(inline_flags());
        let events = Events::default();
        let fetches = Arc::new(AtomicUsize::new(0));

        tracker.start_tracking(
            SERVICE_A,
            true,
            Pcp::P2pPointToPoint,
            events.callbacks(),
            None,
        );
        for &name in [first.as_str(), second.as_str()].iter() {
            let dct = DctAdvertisement::new(SERVICE_A, name, 0xF100, 0x01)
                .unwrap()
                .to_bytes()
                .unwrap();
            tracker.process_found(
                peripheral(),
                sighting(&[(DCT_SERVICE_UUID, dct)]),
                counting_fetcher(fetches.clone(), vec![], true),
            );
        }

        assert_eq!(events.found().len(), 1);
        assert_eq!(events.dct_collisions.lock().unwrap().len(), 1);
    }

    #[test]
    fn threaded_fetch_delivers_discovery() {
        let (tracker, _clock) = tracker_with(FeatureFlags::default());
        let fetches = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);

        let callbacks = DiscoveryCallbacks {
            peripheral_discovered_cb: Some(Box::new(move |_, service_id, data, fast| {
                tx.lock()
                    .unwrap()
                    .send((service_id.to_owned(), data.clone(), fast))
                    .unwrap();
            })),
            ..DiscoveryCallbacks::default()
        };
        tracker.start_tracking(SERVICE_A, false, Pcp::P2pPointToPoint, callbacks, None);

        let fetch_count = fetches.clone();
        let advertisement = gatt_advertisement_bytes(SERVICE_A);
        tracker.process_found(
            peripheral(),
            sighting(&[(COPRESENCE_SERVICE_UUID, header_bytes(&[SERVICE_A], b"seed", false))]),
            Box::new(move |_, _, _, _, read_result| {
                fetch_count.fetch_add(1, Ordering::SeqCst);
                thread::sleep(StdDuration::from_millis(50));
                read_result.add_advertisement(0, advertisement);
                read_result.record_last_read_status(true);
            }),
        );

        let (service_id, data, fast) = rx
            .recv_timeout(StdDuration::from_secs(2))
            .expect("discovery callback");
        assert_eq!(service_id, SERVICE_A);
        assert_eq!(data.as_ref(), DATA);
        assert!(!fast);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn threaded_fetch_result_discarded_after_stop() {
        let (tracker, _clock) = tracker_with(FeatureFlags::default());
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let (fetch_started_tx, fetch_started_rx) = mpsc::channel();

        let callbacks = DiscoveryCallbacks {
            peripheral_discovered_cb: Some(Box::new(move |_, service_id, _, _| {
                tx.lock().unwrap().send(service_id.to_owned()).unwrap();
            })),
            ..DiscoveryCallbacks::default()
        };
        tracker.start_tracking(SERVICE_A, false, Pcp::P2pPointToPoint, callbacks, None);

        let advertisement = gatt_advertisement_bytes(SERVICE_A);
        tracker.process_found(
            peripheral(),
            sighting(&[(COPRESENCE_SERVICE_UUID, header_bytes(&[SERVICE_A], b"seed", false))]),
            Box::new(move |_, _, _, _, read_result| {
                fetch_started_tx.send(()).unwrap();
                thread::sleep(StdDuration::from_millis(100));
                read_result.add_advertisement(0, advertisement);
                read_result.record_last_read_status(true);
            }),
        );

        fetch_started_rx
            .recv_timeout(StdDuration::from_secs(2))
            .expect("fetch should start");
        tracker.stop_tracking(SERVICE_A);

        assert_eq!(
            rx.recv_timeout(StdDuration::from_millis(500)).unwrap_err(),
            RecvTimeoutError::Timeout
        );
    }
}
