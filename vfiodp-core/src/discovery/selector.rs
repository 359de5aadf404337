//! Vendor:device selectors used to pick devices out of the PCI tree.

use crate::error::{DevicePluginError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

/// Regular expression to validate selector format: 8086:0bda
static SELECTOR_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-fA-F]{4}:[0-9a-fA-F]{4}$").expect("Invalid selector regex"));

/// A `vendor:device` PCI id pair, normalized to lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PciSelector {
    vendor_id: String,
    device_id: String,
}

impl PciSelector {
    /// Parse a `vvvv:dddd` selector. Hex digits may be in any case.
    pub fn parse(selector: &str) -> Result<Self> {
        let trimmed = selector.trim();
        if !SELECTOR_REGEX.is_match(trimmed) {
            return Err(DevicePluginError::InvalidSelector { selector: selector.to_string() });
        }

        let lower = trimmed.to_ascii_lowercase();
        let (vendor_id, device_id) = lower
            .split_once(':')
            .ok_or_else(|| DevicePluginError::InvalidSelector { selector: selector.to_string() })?;

        Ok(Self { vendor_id: vendor_id.to_string(), device_id: device_id.to_string() })
    }

    pub fn vendor_id(&self) -> &str {
        &self.vendor_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Check a `PCI_ID` value read from sysfs, ignoring case.
    pub fn matches(&self, pci_id: &str) -> bool {
        match pci_id.trim().split_once(':') {
            Some((vendor, device)) => {
                vendor.eq_ignore_ascii_case(&self.vendor_id)
                    && device.eq_ignore_ascii_case(&self.device_id)
            }
            None => false,
        }
    }
}

impl fmt::Display for PciSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.vendor_id, self.device_id)
    }
}

impl std::str::FromStr for PciSelector {
    type Err = DevicePluginError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
