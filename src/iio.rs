//! IIO attribute access.
//!
//! This module is the seam between the AD9081 accessors and the
//! [`industrial-io`](industrial_io) context. The [`AttrAccess`] trait
//! carries string-level channel and device attribute reads and writes;
//! [`CtrlDevice`] implements it against the control device of real
//! hardware, and the tests of [`crate::mxfe`] implement it against an
//! in-memory map.

use crate::topology::ChannelDesc;
use anyhow::{Context, Result};
use industrial_io as iio;

/// String-level attribute access to the control device.
///
/// Channel attributes are addressed by channel identifier and direction
/// flag (`output`), device attributes by name alone. All failures of the
/// underlying transport propagate unchanged.
pub trait AttrAccess {
    /// Reads a channel attribute.
    fn read_channel_attr(&self, channel: &str, output: bool, attr: &str) -> Result<String>;

    /// Writes a channel attribute.
    fn write_channel_attr(&self, channel: &str, output: bool, attr: &str, value: &str)
        -> Result<()>;

    /// Reads a device-level attribute.
    fn read_device_attr(&self, attr: &str) -> Result<String>;

    /// Writes a device-level attribute.
    fn write_device_attr(&self, attr: &str, value: &str) -> Result<()>;
}

/// Attribute access backed by an IIO device.
pub struct CtrlDevice {
    device: iio::Device,
}

impl CtrlDevice {
    /// Wraps an IIO device.
    pub fn new(device: iio::Device) -> CtrlDevice {
        CtrlDevice { device }
    }

    fn channel(&self, channel: &str, output: bool) -> Result<iio::Channel> {
        self.device.find_channel(channel, output).ok_or_else(|| {
            let direction = if output { "output" } else { "input" };
            anyhow::anyhow!("no {direction} channel {channel} on the control device")
        })
    }
}

impl AttrAccess for CtrlDevice {
    fn read_channel_attr(&self, channel: &str, output: bool, attr: &str) -> Result<String> {
        self.channel(channel, output)?
            .attr_read_str(attr)
            .with_context(|| format!("failed to read IIO attribute {attr} of channel {channel}"))
    }

    fn write_channel_attr(
        &self,
        channel: &str,
        output: bool,
        attr: &str,
        value: &str,
    ) -> Result<()> {
        self.channel(channel, output)?
            .attr_write_str(attr, value)
            .with_context(|| format!("failed to set IIO attribute {attr} of channel {channel}"))
    }

    fn read_device_attr(&self, attr: &str) -> Result<String> {
        self.device
            .attr_read_str(attr)
            .with_context(|| format!("failed to read IIO device attribute {attr}"))
    }

    fn write_device_attr(&self, attr: &str, value: &str) -> Result<()> {
        self.device
            .attr_write_str(attr, value)
            .with_context(|| format!("failed to set IIO device attribute {attr}"))
    }
}

/// Enumerates the channels of an IIO device into plain descriptions.
///
/// Channels the library cannot name are skipped. The `label` attribute is
/// read eagerly where present, since it is only available while the device
/// handle is at hand.
pub fn describe_channels(device: &iio::Device) -> Result<Vec<ChannelDesc>> {
    let mut channels = Vec::new();
    for chan in device.channels() {
        let Some(id) = chan.id() else {
            continue;
        };
        let label = if chan.has_attr("label") {
            Some(
                chan.attr_read_str("label")
                    .with_context(|| format!("failed to read label of channel {id}"))?,
            )
        } else {
            None
        };
        channels.push(ChannelDesc {
            id,
            output: chan.is_output(),
            scan_element: chan.is_scan_element(),
            label,
        });
    }
    Ok(channels)
}
