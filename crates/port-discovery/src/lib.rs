//! Serial port enumeration and change detection.
//!
//! `scan` is a one-shot snapshot; `watch` starts a background poller that
//! diffs successive snapshots and emits `PORT_ADDED`/`PORT_REMOVED` events
//! on an [`event_bus::EventBus`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use event_bus::{EventBus, EventKind};
use repl_proto::PortDescriptor;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// USB vendor IDs of common ESP32/ESP8266 USB-UART bridges (CP210x, CH340,
/// FTDI, native USB).
const ESP_FAMILY_VENDOR_IDS: &[u16] = &[0x10C4, 0x1A86, 0x0403, 0x303A];

/// Fallback keyword match against the port description when the vendor id
/// is unavailable or unrecognized (some platforms only surface a string).
const ESP_FAMILY_KEYWORDS: &[&str] = &["cp210", "ch340", "ftdi", "esp32", "usb-serial"];

/// Default poll interval for [`watch`].
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("failed to enumerate serial ports: {0}")]
    Enumeration(#[from] tokio_serial::Error),
}

/// Whether a port with this vendor id / description looks like a member of
/// the ESP32/ESP8266 USB-UART bridge family.
pub fn is_esp_family(vendor_id: Option<u16>, description: &str) -> bool {
    if let Some(vid) = vendor_id {
        if ESP_FAMILY_VENDOR_IDS.contains(&vid) {
            return true;
        }
    }
    let lower = description.to_ascii_lowercase();
    ESP_FAMILY_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// One-shot enumeration of every serial port currently visible to the OS.
pub fn scan() -> Result<Vec<PortDescriptor>, DiscoveryError> {
    let ports = tokio_serial::available_ports()?;
    Ok(ports
        .into_iter()
        .map(|p| {
            let (vendor_id, product_id, description) = match &p.port_type {
                tokio_serial::SerialPortType::UsbPort(usb) => (
                    Some(usb.vid),
                    Some(usb.pid),
                    usb.product
                        .clone()
                        .unwrap_or_else(|| p.port_name.clone()),
                ),
                _ => (None, None, p.port_name.clone()),
            };
            let is_esp_family = is_esp_family(vendor_id, &description);
            PortDescriptor {
                port_id: p.port_name,
                description,
                vendor_id,
                product_id,
                is_esp_family,
            }
        })
        .collect())
}

/// Like [`scan`] but filtered to the ESP32/ESP8266 USB-UART bridge family.
pub fn scan_family() -> Result<Vec<PortDescriptor>, DiscoveryError> {
    Ok(scan()?.into_iter().filter(|p| p.is_esp_family).collect())
}

/// A running background port watcher. Dropping this without calling
/// [`PortWatcher::stop`] leaves the poller running until the process exits.
pub struct PortWatcher {
    handle: JoinHandle<()>,
}

impl PortWatcher {
    /// Stop the poller and wait for it to finish its current iteration.
    pub async fn stop(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

/// Start polling for port changes every `interval`, emitting an initial
/// `INVENTORY` event and then `PORT_ADDED`/`PORT_REMOVED` per diff.
pub fn watch(bus: Arc<EventBus>, interval: Duration) -> PortWatcher {
    let handle = tokio::spawn(async move {
        let mut known: HashSet<String> = HashSet::new();
        if let Ok(ports) = scan() {
            known = ports.iter().map(|p| p.port_id.clone()).collect();
            bus.emit(
                EventKind::Inventory,
                serde_json::json!({ "ports": ports }),
                None,
            );
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let ports = match scan() {
                Ok(ports) => ports,
                Err(error) => {
                    tracing::warn!(%error, "port scan failed, will retry");
                    continue;
                }
            };
            let current: HashSet<String> = ports.iter().map(|p| p.port_id.clone()).collect();

            for port in &ports {
                if !known.contains(&port.port_id) {
                    bus.emit(
                        EventKind::PortAdded,
                        serde_json::json!(port),
                        Some(port.port_id.clone()),
                    );
                }
            }
            for port_id in known.difference(&current) {
                bus.emit(
                    EventKind::PortRemoved,
                    serde_json::json!({ "port_id": port_id }),
                    Some(port_id.clone()),
                );
            }
            known = current;
        }
    });
    PortWatcher { handle }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn esp_family_matches_known_vendor_ids() {
        assert!(is_esp_family(Some(0x10C4), "CP2102 USB to UART Bridge"));
        assert!(is_esp_family(Some(0x1A86), "USB2.0-Serial"));
        assert!(is_esp_family(Some(0x303A), "USB JTAG/serial debug unit"));
    }

    #[test]
    fn esp_family_falls_back_to_keyword_match() {
        assert!(is_esp_family(None, "CH340 serial converter"));
        assert!(is_esp_family(Some(0x0000), "Generic ESP32 Dev Board"));
    }

    #[test]
    fn esp_family_rejects_unrelated_devices() {
        assert!(!is_esp_family(Some(0x046D), "Logitech USB Receiver"));
        assert!(!is_esp_family(None, "Bluetooth-Incoming-Port"));
    }

    #[tokio::test(start_paused = true)]
    async fn watch_emits_inventory_then_diffs() {
        // scan() talks to the real OS port table, which is empty or
        // unpredictable in CI; this test only checks that the watcher
        // starts and can be stopped cleanly.
        let bus = Arc::new(EventBus::new());
        bus.start();
        let watcher = watch(Arc::clone(&bus), Duration::from_millis(10));
        tokio::time::advance(Duration::from_millis(50)).await;
        watcher.stop().await;
    }
}
