//! Output device enumeration
//!
//! Devices are collected from every available host. On Linux that usually
//! means ALSA hardware devices plus a single JACK or PipeWire entry, which
//! is what makes it possible to send the two routes to different cards.

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Host, HostId};

use super::config::DeviceId;
use super::error::{DeviceError, DeviceResult};

/// Sample rates advertised to the user when a device supports them
const COMMON_SAMPLE_RATES: [u32; 6] = [44100, 48000, 88200, 96000, 176400, 192000];

/// Display name for a host
fn host_name(host_id: HostId) -> String {
    let name = format!("{:?}", host_id);
    match name.as_str() {
        "Alsa" => "ALSA".to_string(),
        "Jack" => "JACK".to_string(),
        "Wasapi" => "WASAPI".to_string(),
        "Asio" => "ASIO".to_string(),
        _ => name,
    }
}

fn host_by_name(name: &str) -> Option<Host> {
    cpal::available_hosts()
        .into_iter()
        .find(|id| host_name(*id) == name)
        .and_then(|id| cpal::host_from_id(id).ok())
}

/// An output device a route can be bound to
#[derive(Debug, Clone, PartialEq)]
pub struct OutputDevice {
    pub id: DeviceId,
    pub name: String,
    pub host: String,
    /// System default for its host
    pub is_default: bool,
    /// Common sample rates inside the device's supported ranges, ascending
    pub sample_rates: Vec<u32>,
    pub max_channels: u16,
}

impl std::fmt::Display for OutputDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.host, self.name)?;
        if self.is_default {
            f.write_str(" (default)")?;
        }
        Ok(())
    }
}

/// List output devices from all hosts, default devices first
pub fn list_output_devices() -> DeviceResult<Vec<OutputDevice>> {
    let mut devices: Vec<OutputDevice> = Vec::new();

    for host_id in cpal::available_hosts() {
        let host = match cpal::host_from_id(host_id) {
            Ok(h) => h,
            Err(e) => {
                log::debug!("Skipping host {:?}: {}", host_id, e);
                continue;
            }
        };
        let host_label = host_name(host_id);

        let default_name = host
            .default_output_device()
            .and_then(|d: cpal::Device| d.name().ok());

        let outputs = match host.output_devices() {
            Ok(d) => d,
            Err(e) => {
                log::debug!("Could not enumerate {:?} outputs: {}", host_id, e);
                continue;
            }
        };

        for device in outputs {
            let Ok(name) = device.name() else {
                continue;
            };
            let Ok(configs) = device.supported_output_configs() else {
                continue;
            };

            let mut sample_rates = Vec::new();
            let mut max_channels = 0u16;
            for config in configs {
                max_channels = max_channels.max(config.channels());
                for rate in COMMON_SAMPLE_RATES {
                    if (config.min_sample_rate().0..=config.max_sample_rate().0).contains(&rate)
                        && !sample_rates.contains(&rate)
                    {
                        sample_rates.push(rate);
                    }
                }
            }
            if max_channels == 0 {
                continue;
            }
            sample_rates.sort_unstable();

            devices.push(OutputDevice {
                id: DeviceId::with_host(&name, &host_label),
                is_default: default_name.as_deref() == Some(name.as_str()),
                name,
                host: host_label.clone(),
                sample_rates,
                max_channels,
            });
        }
    }

    if devices.is_empty() {
        return Err(DeviceError::NoDevices);
    }

    devices.sort_by(|a, b| {
        b.is_default
            .cmp(&a.is_default)
            .then_with(|| a.host.cmp(&b.host))
            .then_with(|| a.name.cmp(&b.name))
    });

    log::info!("Found {} output devices", devices.len());
    Ok(devices)
}

/// Resolve a device id to a CPAL device
///
/// Looks in the named host when the id has one, otherwise in every host.
pub fn find_device(id: &DeviceId) -> DeviceResult<cpal::Device> {
    let matches = |d: &cpal::Device| d.name().ok().as_deref() == Some(id.name.as_str());

    if let Some(host) = id.host.as_deref().and_then(host_by_name) {
        return host
            .output_devices()
            .map_err(|e| DeviceError::Config(e.to_string()))?
            .find(matches)
            .ok_or_else(|| DeviceError::DeviceNotFound(id.display_label()));
    }

    for host_id in cpal::available_hosts() {
        let Ok(host) = cpal::host_from_id(host_id) else {
            continue;
        };
        if let Ok(mut outputs) = host.output_devices() {
            if let Some(device) = outputs.find(matches) {
                return Ok(device);
            }
        }
    }

    Err(DeviceError::DeviceNotFound(id.display_label()))
}

/// The default host's default output, with its id
pub fn default_device() -> DeviceResult<(cpal::Device, DeviceId)> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(DeviceError::NoDevices)?;
    let name = device
        .name()
        .map_err(|e| DeviceError::Config(e.to_string()))?;
    let id = DeviceId::with_host(&name, &host_name(host.id()));
    Ok((device, id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_enumeration() {
        // Machines without audio hardware (CI) legitimately report none
        match list_output_devices() {
            Ok(devices) => {
                for device in &devices {
                    assert!(device.max_channels > 0);
                    assert!(device.sample_rates.windows(2).all(|w| w[0] < w[1]));
                }
                // Defaults sort first
                let first_non_default = devices.iter().position(|d| !d.is_default);
                if let Some(idx) = first_non_default {
                    assert!(devices[idx..].iter().all(|d| !d.is_default));
                }
            }
            Err(DeviceError::NoDevices) => {}
            Err(e) => println!("Device enumeration failed: {}", e),
        }
    }

    #[test]
    fn test_host_name_capitalization() {
        for host_id in cpal::available_hosts() {
            let name = host_name(host_id);
            assert!(!name.is_empty());
            assert_ne!(name, "Alsa");
        }
    }
}
