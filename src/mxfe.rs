//! AD9081 mixed-signal front end control.
//!
//! [`Ad9081`] discovers the converter topology of the device at
//! construction and then exposes the control-plane attributes of the
//! receive and transmit channelizers. Vectorized accessors return and
//! accept one value per channel of the corresponding name list, in list
//! order, so index `i` always addresses the same physical channel.

use crate::{
    iio::{describe_channels, AttrAccess, CtrlDevice},
    topology::{
        sort_data_channels, sort_dds_channels, ChannelDesc, ChannelList, PathMap, StageChannels,
    },
};
use anyhow::{Context, Result};
use industrial_io as iio;

/// Name of the control and receive-data IIO device.
pub const RX_DEVICE: &str = "axi-ad9081-rx-hpc";

/// Name of the transmit-data IIO device.
pub const TX_DEVICE: &str = "axi-ad9081-tx-hpc";

// Scalar attributes are shared across the data path. They are exposed on
// the first in-phase data channel.
const SCALAR_CHANNEL: &str = "voltage0_i";

macro_rules! attr_getset_vec {
    ($attribute:ident, $list:ident, $attr:expr, $output:expr, $doc:expr) => {
        paste::paste! {
            #[doc = concat!("Returns ", $doc, ", one entry per channel in list order.")]
            pub fn [<get_ $attribute>](&self) -> Result<Vec<i64>> {
                self.get_attr_vec(&self.$list, $attr, $output)
            }

            #[doc = concat!("Sets ", $doc,
                            ". The slice must hold one value per channel, in list order.")]
            pub fn [<set_ $attribute>](&self, values: &[i64]) -> Result<()> {
                self.set_attr_vec(&self.$list, $attr, $output, values)
            }
        }
    };
}

macro_rules! attr_getset {
    ($attribute:ident, $attr:expr, $ty:ty, $output:expr, $doc:expr) => {
        paste::paste! {
            #[doc = concat!("Returns ", $doc, ".")]
            pub fn [<get_ $attribute>](&self) -> Result<$ty> {
                self.get_attr(SCALAR_CHANNEL, $output, $attr)
            }

            #[doc = concat!("Sets ", $doc, ".")]
            pub fn [<set_ $attribute>](&self, value: $ty) -> Result<()> {
                self.set_attr(SCALAR_CHANNEL, $output, $attr, value)
            }
        }
    };
}

macro_rules! attr_get {
    ($attribute:ident, $attr:expr, $ty:ty, $output:expr, $doc:expr) => {
        paste::paste! {
            #[doc = concat!("Returns ", $doc, ".")]
            pub fn [<get_ $attribute>](&self) -> Result<$ty> {
                self.get_attr(SCALAR_CHANNEL, $output, $attr)
            }
        }
    };
}

/// AD9081 mixed-signal front end.
///
/// Construction enumerates the channels of the control device, rebuilds
/// the converter → coarse → fine path map from their labels and sorts the
/// data, DDS and stage channel lists. Those lists are immutable for the
/// lifetime of the value; every accessor afterwards is a synchronous round
/// trip to the attribute layer.
pub struct Ad9081<A = CtrlDevice> {
    attrs: A,
    path_map: PathMap,
    rx_channels: ChannelList,
    tx_channels: ChannelList,
    dds_channels: ChannelList,
    rx_coarse_ddc: ChannelList,
    rx_fine_ddc: ChannelList,
    tx_coarse_duc: ChannelList,
    tx_fine_duc: ChannelList,
}

impl Ad9081 {
    /// Opens the AD9081 found in the IIO context at `uri`.
    pub fn from_uri(uri: &str) -> Result<Ad9081> {
        let ctx = iio::Context::from_uri(uri)
            .with_context(|| format!("failed to open IIO context {uri}"))?;
        Ad9081::from_context(&ctx)
    }

    /// Opens the AD9081 in an existing IIO context.
    #[tracing::instrument(name = "Ad9081::from_context", level = "debug", skip_all)]
    pub fn from_context(ctx: &iio::Context) -> Result<Ad9081> {
        let rx_device = ctx
            .find_device(RX_DEVICE)
            .ok_or_else(|| anyhow::anyhow!("IIO device {RX_DEVICE} not found"))?;
        let tx_device = ctx
            .find_device(TX_DEVICE)
            .ok_or_else(|| anyhow::anyhow!("IIO device {TX_DEVICE} not found"))?;
        let rx_channels = describe_channels(&rx_device)?;
        let tx_channels = describe_channels(&tx_device)?;
        Ad9081::with_attrs(CtrlDevice::new(rx_device), &rx_channels, &tx_channels)
    }
}

impl<A: AttrAccess> Ad9081<A> {
    /// Builds the front end from an attribute backend and the channel
    /// enumerations of the receive and transmit devices.
    ///
    /// The receive device doubles as control device: its labeled channels
    /// (both directions) define the path map, and its scan-enabled input
    /// channels are the receive data channels. Scan-enabled channels of
    /// the transmit device are the transmit data channels; the rest are
    /// DDS tone generators.
    pub fn with_attrs(attrs: A, rx: &[ChannelDesc], tx: &[ChannelDesc]) -> Result<Ad9081<A>> {
        let path_map = PathMap::from_channels(rx)?;
        let stages = StageChannels::from_path_map(&path_map)?;

        let rx_data: Vec<String> = rx
            .iter()
            .filter(|ch| ch.scan_element && !ch.output)
            .map(|ch| ch.id.clone())
            .collect();
        let mut tx_data = Vec::new();
        let mut dds = Vec::new();
        for ch in tx {
            if ch.scan_element {
                tx_data.push(ch.id.clone());
            } else {
                dds.push(ch.id.clone());
            }
        }

        let mxfe = Ad9081 {
            attrs,
            rx_channels: sort_data_channels(&rx_data)?,
            tx_channels: sort_data_channels(&tx_data)?,
            dds_channels: sort_dds_channels(&dds)?,
            rx_coarse_ddc: stages.rx_coarse,
            rx_fine_ddc: stages.rx_fine,
            tx_coarse_duc: stages.tx_coarse,
            tx_fine_duc: stages.tx_fine,
            path_map,
        };
        tracing::debug!(
            rx = ?mxfe.rx_channels,
            tx = ?mxfe.tx_channels,
            dds = ?mxfe.dds_channels,
            "sorted data channels"
        );
        Ok(mxfe)
    }

    /// Returns the converter → coarse → fine → channel-id map.
    pub fn path_map(&self) -> &PathMap {
        &self.path_map
    }

    /// Returns the receive data channels, I/Q interleaved.
    pub fn rx_channels(&self) -> &ChannelList {
        &self.rx_channels
    }

    /// Returns the transmit data channels, I/Q interleaved.
    pub fn tx_channels(&self) -> &ChannelList {
        &self.tx_channels
    }

    /// Returns the DDS tone-generator channels.
    pub fn dds_channels(&self) -> &ChannelList {
        &self.dds_channels
    }

    fn get_attr<T: std::str::FromStr>(&self, channel: &str, output: bool, attr: &str) -> Result<T> {
        let value = self.attrs.read_channel_attr(channel, output, attr)?;
        value
            .trim_end()
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("failed to parse IIO attribute {attr} value {value:?}"))
    }

    fn set_attr<T: std::fmt::Display>(
        &self,
        channel: &str,
        output: bool,
        attr: &str,
        value: T,
    ) -> Result<()> {
        self.attrs
            .write_channel_attr(channel, output, attr, &value.to_string())
    }

    fn get_attr_vec(&self, list: &ChannelList, attr: &str, output: bool) -> Result<Vec<i64>> {
        list.names()
            .iter()
            .map(|name| self.get_attr(name, output, attr))
            .collect()
    }

    fn set_attr_vec(
        &self,
        list: &ChannelList,
        attr: &str,
        output: bool,
        values: &[i64],
    ) -> Result<()> {
        anyhow::ensure!(
            values.len() == list.len(),
            "expected {} values for {attr}, got {}",
            list.len(),
            values.len()
        );
        for (name, &value) in list.names().iter().zip(values) {
            self.set_attr(name, output, attr, value)?;
        }
        Ok(())
    }

    attr_getset_vec!(
        rx_channel_nco_frequencies,
        rx_fine_ddc,
        "channel_nco_frequency",
        false,
        "the receive path fine DDC NCO frequencies in Hz"
    );
    attr_getset_vec!(
        rx_channel_nco_phases,
        rx_fine_ddc,
        "channel_nco_phase",
        false,
        "the receive path fine DDC NCO phases in millidegrees"
    );
    attr_getset_vec!(
        rx_main_nco_frequencies,
        rx_coarse_ddc,
        "main_nco_frequency",
        false,
        "the receive path coarse DDC NCO frequencies in Hz"
    );
    attr_getset_vec!(
        rx_main_nco_phases,
        rx_coarse_ddc,
        "main_nco_phase",
        false,
        "the receive path coarse DDC NCO phases in millidegrees"
    );
    attr_getset_vec!(
        tx_channel_nco_frequencies,
        tx_fine_duc,
        "channel_nco_frequency",
        true,
        "the transmit path fine DUC NCO frequencies in Hz"
    );
    attr_getset_vec!(
        tx_channel_nco_phases,
        tx_fine_duc,
        "channel_nco_phase",
        true,
        "the transmit path fine DUC NCO phases in millidegrees"
    );
    attr_getset_vec!(
        tx_main_nco_frequencies,
        tx_coarse_duc,
        "main_nco_frequency",
        true,
        "the transmit path coarse DUC NCO frequencies in Hz"
    );
    attr_getset_vec!(
        tx_main_nco_phases,
        tx_coarse_duc,
        "main_nco_phase",
        true,
        "the transmit path coarse DUC NCO phases in millidegrees"
    );

    attr_getset!(
        rx_test_mode,
        "test_mode",
        String,
        false,
        "the ADC test mode (`off`, `midscale_short`, `pn9`, `pn23`, ...)"
    );
    attr_getset!(
        rx_nyquist_zone,
        "nyquist_zone",
        NyquistZone,
        false,
        "the ADC nyquist zone"
    );
    attr_getset!(
        tx_main_ffh_index,
        "main_ffh_index",
        i64,
        true,
        "the transmitter fast frequency hopping NCO bank index"
    );
    attr_getset!(
        tx_main_ffh_mode,
        "main_ffh_mode",
        FfhMode,
        true,
        "the transmitter fast frequency hopping transition mode"
    );

    /// Returns the NCO frequency in Hz of the fast frequency hopping bank
    /// selected by `tx_main_ffh_index`.
    pub fn get_tx_main_ffh_frequency(&self) -> Result<i64> {
        self.get_attr(SCALAR_CHANNEL, true, "main_ffh_frequency")
    }

    /// Sets the NCO frequency in Hz of the fast frequency hopping bank
    /// selected by `tx_main_ffh_index`.
    ///
    /// Bank 0 is the main NCO itself, so writing a hop frequency requires
    /// a non-zero bank index; otherwise this fails without touching the
    /// device.
    pub fn set_tx_main_ffh_frequency(&self, value: i64) -> Result<()> {
        if self.get_tx_main_ffh_index()? == 0 {
            anyhow::bail!(
                "to set a FFH NCO bank frequency, tx_main_ffh_index must be greater than 0"
            );
        }
        self.set_attr(SCALAR_CHANNEL, true, "main_ffh_frequency", value)
    }

    /// Returns the RX→TX loopback mode of the device.
    pub fn get_loopback_mode(&self) -> Result<i64> {
        let value = self.attrs.read_device_attr("loopback_mode")?;
        value
            .trim_end()
            .parse()
            .map_err(|_| anyhow::anyhow!("failed to parse loopback_mode value {value:?}"))
    }

    /// Sets the RX→TX loopback mode of the device.
    pub fn set_loopback_mode(&self, value: i64) -> Result<()> {
        self.attrs
            .write_device_attr("loopback_mode", &value.to_string())
    }

    attr_get!(
        rx_sampling_frequency,
        "sampling_frequency",
        i64,
        false,
        "the receive sample rate in Hz after decimation"
    );
    attr_get!(
        adc_frequency,
        "adc_frequency",
        i64,
        false,
        "the ADC conversion rate in Hz"
    );
    attr_get!(
        tx_sampling_frequency,
        "sampling_frequency",
        i64,
        true,
        "the transmit sample rate in Hz before interpolation"
    );
    attr_get!(
        dac_frequency,
        "dac_frequency",
        i64,
        true,
        "the DAC conversion rate in Hz"
    );
}

/// ADC nyquist zones.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum NyquistZone {
    /// Odd nyquist zones (baseband sampling).
    Odd,
    /// Even nyquist zones (folded sampling).
    Even,
}

impl std::str::FromStr for NyquistZone {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "odd" => NyquistZone::Odd,
            "even" => NyquistZone::Even,
            _ => return Err(()),
        })
    }
}

impl std::fmt::Display for NyquistZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "{}",
            match self {
                NyquistZone::Odd => "odd",
                NyquistZone::Even => "even",
            }
        )
    }
}

/// Fast frequency hopping phase transition modes.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum FfhMode {
    /// Phase is continuous across hops.
    PhaseContinuous,
    /// Phase jumps freely across hops.
    PhaseIncontinuous,
    /// Phase stays coherent with the hopped-from NCO.
    PhaseCoherent,
}

impl std::str::FromStr for FfhMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "phase_continuous" => FfhMode::PhaseContinuous,
            "phase_incontinuous" => FfhMode::PhaseIncontinuous,
            "phase_coherent" => FfhMode::PhaseCoherent,
            _ => return Err(()),
        })
    }
}

impl std::fmt::Display for FfhMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "{}",
            match self {
                FfhMode::PhaseContinuous => "phase_continuous",
                FfhMode::PhaseIncontinuous => "phase_incontinuous",
                FfhMode::PhaseCoherent => "phase_coherent",
            }
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{cell::RefCell, collections::HashMap};

    #[derive(Default)]
    struct MockAttrs {
        channel: RefCell<HashMap<(String, bool, String), String>>,
        device: RefCell<HashMap<String, String>>,
        channel_writes: RefCell<Vec<String>>,
    }

    impl MockAttrs {
        fn seed_channel(&self, channel: &str, output: bool, attr: &str, value: &str) {
            self.channel.borrow_mut().insert(
                (channel.to_string(), output, attr.to_string()),
                value.to_string(),
            );
        }

        fn written_attrs(&self) -> Vec<String> {
            self.channel_writes.borrow().clone()
        }
    }

    impl AttrAccess for MockAttrs {
        fn read_channel_attr(&self, channel: &str, output: bool, attr: &str) -> Result<String> {
            self.channel
                .borrow()
                .get(&(channel.to_string(), output, attr.to_string()))
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no attribute {attr} on channel {channel}"))
        }

        fn write_channel_attr(
            &self,
            channel: &str,
            output: bool,
            attr: &str,
            value: &str,
        ) -> Result<()> {
            self.channel_writes.borrow_mut().push(attr.to_string());
            self.seed_channel(channel, output, attr, value);
            Ok(())
        }

        fn read_device_attr(&self, attr: &str) -> Result<String> {
            self.device
                .borrow()
                .get(attr)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no device attribute {attr}"))
        }

        fn write_device_attr(&self, attr: &str, value: &str) -> Result<()> {
            self.device
                .borrow_mut()
                .insert(attr.to_string(), value.to_string());
            Ok(())
        }
    }

    fn chan(id: &str, output: bool, scan: bool, label: Option<&str>) -> ChannelDesc {
        ChannelDesc {
            id: id.to_string(),
            output,
            scan_element: scan,
            label: label.map(|s| s.to_string()),
        }
    }

    // Two fine DDCs under one coarse DDC on the ADC side, one fine DUC on
    // the DAC side, plus two DDS generators on the transmit device.
    fn testbed() -> Ad9081<MockAttrs> {
        let rx = [
            chan("voltage0_i", false, true, Some("FDDC0->CDDC0->ADC0")),
            chan("voltage0_q", false, true, Some("FDDC0->CDDC0->ADC0")),
            chan("voltage1_i", false, true, Some("FDDC1->CDDC0->ADC0")),
            chan("voltage1_q", false, true, Some("FDDC1->CDDC0->ADC0")),
            chan("voltage0_i", true, false, Some("FDUC0->CDUC0->DAC0")),
            chan("voltage0_q", true, false, Some("FDUC0->CDUC0->DAC0")),
        ];
        let tx = [
            chan("voltage0_i", true, true, None),
            chan("voltage0_q", true, true, None),
            chan("altvoltage1", true, false, None),
            chan("altvoltage0", true, false, None),
        ];
        Ad9081::with_attrs(MockAttrs::default(), &rx, &tx).unwrap()
    }

    #[test]
    fn channel_lists_from_enumeration() {
        let mxfe = testbed();
        assert_eq!(
            mxfe.rx_channels().names(),
            ["voltage0_i", "voltage0_q", "voltage1_i", "voltage1_q"]
        );
        assert_eq!(mxfe.tx_channels().names(), ["voltage0_i", "voltage0_q"]);
        assert_eq!(mxfe.dds_channels().names(), ["altvoltage0", "altvoltage1"]);
        assert_eq!(
            mxfe.path_map().get("ADC0", "CDDC0", "FDDC1").unwrap(),
            ["voltage1_i", "voltage1_q"]
        );
    }

    #[test]
    fn vectorized_round_trip_preserves_order() {
        let mxfe = testbed();
        mxfe.attrs
            .seed_channel("voltage0_i", false, "channel_nco_frequency", "1000");
        mxfe.attrs
            .seed_channel("voltage1_i", false, "channel_nco_frequency", "2000");
        assert_eq!(
            mxfe.get_rx_channel_nco_frequencies().unwrap(),
            [1000, 2000]
        );
        mxfe.set_rx_channel_nco_frequencies(&[3000, 4000]).unwrap();
        assert_eq!(
            mxfe.get_rx_channel_nco_frequencies().unwrap(),
            [3000, 4000]
        );
    }

    #[test]
    fn vectorized_set_checks_the_length() {
        let mxfe = testbed();
        assert!(mxfe.set_rx_channel_nco_frequencies(&[1000]).is_err());
        assert!(mxfe.attrs.written_attrs().is_empty());
    }

    #[test]
    fn ffh_frequency_requires_nonzero_bank_index() {
        let mxfe = testbed();
        mxfe.attrs
            .seed_channel("voltage0_i", true, "main_ffh_index", "0");
        assert!(mxfe.set_tx_main_ffh_frequency(1_000_000_000).is_err());
        assert!(!mxfe
            .attrs
            .written_attrs()
            .contains(&"main_ffh_frequency".to_string()));

        mxfe.set_tx_main_ffh_index(2).unwrap();
        mxfe.set_tx_main_ffh_frequency(1_000_000_000).unwrap();
        assert_eq!(mxfe.get_tx_main_ffh_frequency().unwrap(), 1_000_000_000);
    }

    #[test]
    fn scalar_attributes_trim_before_parsing() {
        let mxfe = testbed();
        mxfe.attrs
            .seed_channel("voltage0_i", false, "adc_frequency", "4000000000\n");
        assert_eq!(mxfe.get_adc_frequency().unwrap(), 4_000_000_000);
    }

    #[test]
    fn enum_attributes_round_trip() {
        let mxfe = testbed();
        mxfe.attrs
            .seed_channel("voltage0_i", false, "nyquist_zone", "odd");
        assert_eq!(mxfe.get_rx_nyquist_zone().unwrap(), NyquistZone::Odd);
        mxfe.set_rx_nyquist_zone(NyquistZone::Even).unwrap();
        assert_eq!(mxfe.get_rx_nyquist_zone().unwrap(), NyquistZone::Even);

        mxfe.set_tx_main_ffh_mode(FfhMode::PhaseCoherent).unwrap();
        assert_eq!(
            mxfe.get_tx_main_ffh_mode().unwrap(),
            FfhMode::PhaseCoherent
        );
    }

    #[test]
    fn loopback_mode_is_a_device_attribute() {
        let mxfe = testbed();
        mxfe.set_loopback_mode(1).unwrap();
        assert_eq!(mxfe.get_loopback_mode().unwrap(), 1);
        assert!(mxfe.attrs.written_attrs().is_empty());
    }
}
