//! Discovery stack configuration.
//!
//! [`FeatureFlags`] gates behaviors that roll out independently of the wire
//! formats; the constants below are protocol-level configuration shared by
//! advertisers and scanners.

use crate::time::Duration;
use crate::uuid::Uuid128;

/// The service UUID under which advertisement headers (and forced-loss
/// advertisements) travel in BLE service data.
pub const COPRESENCE_SERVICE_UUID: Uuid128 =
    Uuid128::parse_static("0000fef3-0000-1000-8000-00805f9b34fb");

/// The service UUID carrying DCT advertisements.
pub const DCT_SERVICE_UUID: Uuid128 =
    Uuid128::parse_static("0000fcf1-0000-1000-8000-00805f9b34fb");

/// Sentinel service-data value advertised by legacy devices that cannot carry
/// a real advertisement header. Deliberately too short to parse as one.
pub const DUMMY_ADVERTISEMENT_BYTES: &[u8] = &[0x00, 0x00, 0x00, 0x00];

/// Runtime feature toggles consumed by the discovery tracker.
#[derive(Debug, Clone)]
pub struct FeatureFlags {
    /// Honor forced-loss advertisements immediately instead of waiting for
    /// the next sweep.
    pub enable_instant_on_lost: bool,

    /// Run GATT fetches on a dedicated worker thread instead of inline in
    /// the scanner callback.
    pub enable_gatt_query_in_thread: bool,

    /// Defer GATT reads for headers that advertise extended-advertisement
    /// support, in the expectation that the full advertisement arrives over
    /// the air.
    pub enable_read_gatt_for_extended_advertisement: bool,

    /// Report the legacy-device sentinel advertisement to the
    /// `legacy_device_discovered_cb`.
    pub enable_invoking_legacy_device_discovered_cb: bool,

    /// Bluetooth Classic scanning is unavailable, so interesting BLE headers
    /// double as legacy-device evidence.
    pub disable_bluetooth_classic_scanning: bool,

    /// Cadence at which callers are expected to run the lost-peripheral
    /// sweep.
    pub ble_peripheral_lost_timeout: Duration,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            enable_instant_on_lost: false,
            enable_gatt_query_in_thread: true,
            enable_read_gatt_for_extended_advertisement: false,
            enable_invoking_legacy_device_discovered_cb: true,
            disable_bluetooth_classic_scanning: false,
            ble_peripheral_lost_timeout: Duration::from_secs(3),
        }
    }
}

/// Pre-connection protocol under which a service is being discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pcp {
    P2pCluster,
    P2pStar,
    P2pPointToPoint,
}
