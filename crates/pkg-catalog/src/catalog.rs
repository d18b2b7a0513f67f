//! The static *quick* install catalogue: a representative subset of
//! well-known pure-Python MicroPython packages, each with its declared
//! remote file placement and fetch URL.

use repl_proto::{PackageDescriptor, PackageFile};

fn file(remote_path: &str, fetch_url: &str) -> PackageFile {
    PackageFile {
        remote_path: remote_path.to_string(),
        fetch_url: Some(fetch_url.to_string()),
    }
}

/// The quick catalogue, rebuilt on every lookup. Small and static enough
/// that this costs nothing worth caching.
pub fn quick_catalogue() -> Vec<PackageDescriptor> {
    vec![
        PackageDescriptor {
            name: "umqtt.simple".to_string(),
            description: "Minimal MQTT client".to_string(),
            category: "networking".to_string(),
            dependencies: vec![],
            files: vec![file(
                "/lib/umqtt/simple.py",
                "https://raw.githubusercontent.com/micropython/micropython-lib/master/micropython/umqtt.simple/umqtt/simple.py",
            )],
        },
        PackageDescriptor {
            name: "umqtt.robust".to_string(),
            description: "Reconnecting wrapper around umqtt.simple".to_string(),
            category: "networking".to_string(),
            dependencies: vec!["umqtt.simple".to_string()],
            files: vec![file(
                "/lib/umqtt/robust.py",
                "https://raw.githubusercontent.com/micropython/micropython-lib/master/micropython/umqtt.robust/umqtt/robust.py",
            )],
        },
        PackageDescriptor {
            name: "urequests".to_string(),
            description: "requests-like HTTP client".to_string(),
            category: "networking".to_string(),
            dependencies: vec![],
            files: vec![file(
                "/lib/urequests.py",
                "https://raw.githubusercontent.com/micropython/micropython-lib/master/python-ecosys/urequests/urequests.py",
            )],
        },
        PackageDescriptor {
            name: "ntptime".to_string(),
            description: "Set the RTC from an NTP server".to_string(),
            category: "networking".to_string(),
            dependencies: vec![],
            files: vec![file(
                "/lib/ntptime.py",
                "https://raw.githubusercontent.com/micropython/micropython-lib/master/micropython/net/ntptime/ntptime.py",
            )],
        },
        PackageDescriptor {
            name: "ssd1306".to_string(),
            description: "SSD1306 OLED display driver".to_string(),
            category: "display".to_string(),
            dependencies: vec![],
            files: vec![file(
                "/lib/ssd1306.py",
                "https://raw.githubusercontent.com/micropython/micropython-lib/master/micropython/drivers/display/ssd1306/ssd1306.py",
            )],
        },
        PackageDescriptor {
            name: "bme280".to_string(),
            description: "BME280 temperature/humidity/pressure sensor driver".to_string(),
            category: "sensor".to_string(),
            dependencies: vec![],
            files: vec![file(
                "/lib/bme280.py",
                "https://raw.githubusercontent.com/micropython/micropython-lib/master/micropython/drivers/sensor/bme280/bme280.py",
            )],
        },
        PackageDescriptor {
            name: "dht".to_string(),
            description: "DHT11/DHT22 sensor driver".to_string(),
            category: "sensor".to_string(),
            dependencies: vec![],
            files: vec![file(
                "/lib/dht.py",
                "https://raw.githubusercontent.com/micropython/micropython-lib/master/micropython/drivers/sensor/dht/dht.py",
            )],
        },
        PackageDescriptor {
            name: "neopixel".to_string(),
            description: "WS2812/NeoPixel strip driver".to_string(),
            category: "display".to_string(),
            dependencies: vec![],
            files: vec![file(
                "/lib/neopixel.py",
                "https://raw.githubusercontent.com/micropython/micropython-lib/master/micropython/drivers/led/neopixel/neopixel.py",
            )],
        },
    ]
}

pub fn find(name: &str) -> Option<PackageDescriptor> {
    quick_catalogue().into_iter().find(|p| p.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn umqtt_robust_depends_on_umqtt_simple() {
        let robust = find("umqtt.robust").unwrap();
        assert_eq!(robust.dependencies, vec!["umqtt.simple".to_string()]);
    }

    #[test]
    fn unknown_package_is_absent() {
        assert!(find("not-a-real-package").is_none());
    }

    #[test]
    fn every_entry_declares_at_least_one_file() {
        for entry in quick_catalogue() {
            assert!(!entry.files.is_empty(), "{} has no files", entry.name);
        }
    }
}
