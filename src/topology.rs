//! Channel-topology discovery.
//!
//! The AD9081 driver exposes its signal paths as a flat list of IIO
//! channels. Data channels carry a `label` attribute of the form
//! `FDDC0->CDDC0->ADC0` that encodes their position in the three-stage
//! path (fine channelizer, coarse channelizer, converter). This module
//! rebuilds the nested structure from those labels and derives the sorted
//! channel-name lists that the accessors in [`crate::mxfe`] use as
//! positional keys.

use anyhow::{Context, Result};
use indexmap::IndexMap;

/// Separator between the tokens of a channel label.
const LABEL_SEPARATOR: &str = "->";

/// Prefix of data channel identifiers (`voltage0_i`, `voltage1_q`, ...).
const DATA_CHANNEL_PREFIX: &str = "voltage";

/// Prefix of DDS channel identifiers (`altvoltage0`, ...).
const DDS_CHANNEL_PREFIX: &str = "altvoltage";

/// Token that marks a converter as belonging to the receive side.
const ADC_TOKEN: &str = "ADC";

/// Description of one IIO channel, as enumerated from a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDesc {
    /// Channel identifier (for instance `voltage0_i`).
    pub id: String,
    /// Direction flag; `true` for output (DAC-side) channels.
    pub output: bool,
    /// Whether the channel carries streamed data rather than being
    /// attribute-only.
    pub scan_element: bool,
    /// Signal-path label, if the channel has one.
    pub label: Option<String>,
}

/// Receive/transmit classification of a converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Receive (ADC) side.
    Rx,
    /// Transmit (DAC) side.
    Tx,
}

/// Converter identifier parsed from a channel label (`ADC0`, `DAC1`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConverterId {
    name: String,
    side: Side,
}

impl ConverterId {
    fn new(token: &str) -> Result<ConverterId> {
        anyhow::ensure!(!token.is_empty(), "empty converter token");
        // The converter name is the only signal distinguishing receive from
        // transmit groups in existing device descriptions.
        let side = if token.contains(ADC_TOKEN) {
            Side::Rx
        } else {
            Side::Tx
        };
        Ok(ConverterId {
            name: token.to_string(),
            side,
        })
    }

    /// Returns the converter name as it appears in the label.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the side this converter belongs to.
    pub fn side(&self) -> Side {
        self.side
    }
}

impl std::fmt::Display for ConverterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

macro_rules! stage_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $name(String);

        impl $name {
            fn new(token: &str) -> Result<$name> {
                anyhow::ensure!(
                    !token.is_empty(),
                    concat!("empty ", stringify!($name), " token")
                );
                Ok($name(token.to_string()))
            }

            /// Returns the stage name as it appears in the label.
            pub fn name(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

stage_id!(
    CoarseId,
    "Coarse channelizer identifier parsed from a channel label (`CDDC0`, `CDUC1`, ...)."
);
stage_id!(
    FineId,
    "Fine channelizer identifier parsed from a channel label (`FDDC0`, `FDUC1`, ...)."
);

/// A channel label split into its three path tokens.
///
/// The label string nests in reverse: the first token is the innermost key
/// of the path map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathLabel {
    /// Fine channelizer the channel belongs to.
    pub fine: FineId,
    /// Coarse channelizer feeding the fine stage.
    pub coarse: CoarseId,
    /// Converter feeding the coarse stage.
    pub converter: ConverterId,
}

impl std::str::FromStr for PathLabel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<PathLabel> {
        let mut tokens = s.split(LABEL_SEPARATOR);
        match (tokens.next(), tokens.next(), tokens.next(), tokens.next()) {
            (Some(fine), Some(coarse), Some(converter), None) => Ok(PathLabel {
                fine: FineId::new(fine)?,
                coarse: CoarseId::new(coarse)?,
                converter: ConverterId::new(converter)?,
            }),
            _ => anyhow::bail!("label {s:?} does not have the form fine->coarse->converter"),
        }
    }
}

type FineMap = IndexMap<FineId, Vec<String>>;
type CoarseMap = IndexMap<CoarseId, FineMap>;

/// Nested converter → coarse stage → fine stage → channel-id map.
///
/// Built once from the labeled channels of the control device and
/// read-only afterwards. All levels preserve label insertion order, which
/// follows the channel order reported by the device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathMap(IndexMap<ConverterId, CoarseMap>);

impl PathMap {
    /// Builds the path map from an enumeration of channels.
    ///
    /// Channels without a label do not participate in the topology and are
    /// skipped. A label that does not split into exactly three tokens is an
    /// error.
    pub fn from_channels<'a, I>(channels: I) -> Result<PathMap>
    where
        I: IntoIterator<Item = &'a ChannelDesc>,
    {
        let mut map = PathMap::default();
        for ch in channels {
            let Some(label) = &ch.label else {
                continue;
            };
            let label: PathLabel = label
                .parse()
                .with_context(|| format!("bad label on channel {}", ch.id))?;
            map.0
                .entry(label.converter)
                .or_default()
                .entry(label.coarse)
                .or_default()
                .entry(label.fine)
                .or_default()
                .push(ch.id.clone());
        }
        Ok(map)
    }

    /// Returns the channel ids under a `(converter, coarse, fine)` triple.
    pub fn get(&self, converter: &str, coarse: &str, fine: &str) -> Option<&[String]> {
        let (_, coarse_map) = self.0.iter().find(|(c, _)| c.name() == converter)?;
        let (_, fine_map) = coarse_map.iter().find(|(c, _)| c.name() == coarse)?;
        let (_, channels) = fine_map.iter().find(|(f, _)| f.name() == fine)?;
        Some(channels)
    }

    /// Iterates over the `(converter, coarse, fine, channels)` leaves in
    /// insertion order.
    pub fn leaves(&self) -> impl Iterator<Item = (&ConverterId, &CoarseId, &FineId, &[String])> {
        self.0.iter().flat_map(|(converter, coarse_map)| {
            coarse_map.iter().flat_map(move |(coarse, fine_map)| {
                fine_map
                    .iter()
                    .map(move |(fine, channels)| (converter, coarse, fine, channels.as_slice()))
            })
        })
    }

    /// Returns `true` if no labeled channel was found.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Ordered list of channel identifiers.
///
/// The derived name lists are wrapped in this type so that "position in
/// the list" keeps meaning "specific physical channel": vectorized
/// attribute reads and writes address the hardware through this order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelList(Vec<String>);

impl ChannelList {
    /// Returns the channel names in list order.
    pub fn names(&self) -> &[String] {
        &self.0
    }

    /// Returns the number of channels in the list.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the list has no channels.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the first channel name, if any.
    pub fn first(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }
}

fn data_index(name: &str) -> Result<u32> {
    let rest = name
        .strip_prefix(DATA_CHANNEL_PREFIX)
        .ok_or_else(|| anyhow::anyhow!("channel {name:?} does not start with {DATA_CHANNEL_PREFIX:?}"))?;
    let digits = match rest.find('_') {
        Some(pos) => &rest[..pos],
        None => rest,
    };
    digits
        .parse()
        .with_context(|| format!("channel {name:?} has no numeric index"))
}

fn dds_index(name: &str) -> Result<u32> {
    name.strip_prefix(DDS_CHANNEL_PREFIX)
        .ok_or_else(|| anyhow::anyhow!("channel {name:?} does not start with {DDS_CHANNEL_PREFIX:?}"))?
        .parse()
        .with_context(|| format!("channel {name:?} has no numeric index"))
}

fn sort_by_index<'a>(names: impl Iterator<Item = &'a String>) -> Result<Vec<&'a String>> {
    let mut keyed = names
        .map(|name| data_index(name).map(|index| (index, name)))
        .collect::<Result<Vec<_>>>()?;
    keyed.sort_by_key(|&(index, _)| index);
    Ok(keyed.into_iter().map(|(_, name)| name).collect())
}

/// Sorts data channel names into interleaved I/Q pairs.
///
/// Names are partitioned into in-phase (`_i`) and quadrature (`_q`)
/// components, each partition is sorted by the numeric index following the
/// `voltage` prefix, and the result interleaves them pairwise so that the
/// overall order matches ascending hardware channel index. Names carrying
/// neither component marker are dropped.
pub fn sort_data_channels(names: &[String]) -> Result<ChannelList> {
    let inphase = sort_by_index(names.iter().filter(|n| n.contains("_i")))?;
    let quadrature = sort_by_index(names.iter().filter(|n| n.contains("_q")))?;
    anyhow::ensure!(
        inphase.len() == quadrature.len(),
        "{} in-phase data channels but {} quadrature ones",
        inphase.len(),
        quadrature.len()
    );
    let mut out = Vec::with_capacity(names.len());
    for (i, q) in inphase.into_iter().zip(quadrature) {
        out.push(i.clone());
        out.push(q.clone());
    }
    Ok(ChannelList(out))
}

/// Sorts DDS channel names by the numeric suffix following the
/// `altvoltage` prefix. DDS tones are real, so there is no pairing.
pub fn sort_dds_channels(names: &[String]) -> Result<ChannelList> {
    let mut keyed = names
        .iter()
        .map(|name| dds_index(name).map(|index| (index, name)))
        .collect::<Result<Vec<_>>>()?;
    keyed.sort_by_key(|&(index, _)| index);
    Ok(ChannelList(
        keyed.into_iter().map(|(_, name)| name.clone()).collect(),
    ))
}

/// Coarse-stage representatives and fine-stage members derived from a
/// [`PathMap`], split by converter side.
///
/// Each entry is the in-phase channel id that carries the NCO attributes
/// of its stage, so these lists are what the vectorized `main_nco_*` and
/// `channel_nco_*` accessors iterate over.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageChannels {
    /// One representative per receive (converter, coarse stage) group.
    pub rx_coarse: ChannelList,
    /// All receive fine-stage in-phase channels, grouped by coarse stage.
    pub rx_fine: ChannelList,
    /// One representative per transmit (converter, coarse stage) group.
    pub tx_coarse: ChannelList,
    /// All transmit fine-stage in-phase channels, grouped by coarse stage.
    pub tx_fine: ChannelList,
}

impl StageChannels {
    /// Derives the stage lists from a path map.
    ///
    /// For every (converter, coarse stage) group the in-phase channel ids
    /// of its fine buckets are collected in insertion order; the first one
    /// represents the coarse stage and all of them join the fine-stage
    /// list of the converter's side. A group without in-phase channels is
    /// an inconsistent hardware description and fails.
    pub fn from_path_map(map: &PathMap) -> Result<StageChannels> {
        let mut stages = StageChannels::default();
        for (converter, coarse_map) in &map.0 {
            for (coarse, fine_map) in coarse_map {
                let inphase: Vec<&String> = fine_map
                    .values()
                    .flatten()
                    .filter(|id| id.contains("_i"))
                    .collect();
                let Some(&first) = inphase.first() else {
                    anyhow::bail!("no in-phase channels under {converter}/{coarse}");
                };
                let (coarse_list, fine_list) = match converter.side() {
                    Side::Rx => (&mut stages.rx_coarse, &mut stages.rx_fine),
                    Side::Tx => (&mut stages.tx_coarse, &mut stages.tx_fine),
                };
                coarse_list.0.push(first.clone());
                fine_list.0.extend(inphase.into_iter().cloned());
            }
        }
        Ok(stages)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn labeled(id: &str, label: &str) -> ChannelDesc {
        ChannelDesc {
            id: id.to_string(),
            output: false,
            scan_element: true,
            label: Some(label.to_string()),
        }
    }

    fn unlabeled(id: &str) -> ChannelDesc {
        ChannelDesc {
            id: id.to_string(),
            output: false,
            scan_element: false,
            label: None,
        }
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn path_map_preserves_insertion_order() {
        let channels = [
            labeled("voltage0_i", "FDDC0->CDDC0->ADC0"),
            labeled("voltage0_q", "FDDC0->CDDC0->ADC0"),
        ];
        let map = PathMap::from_channels(&channels).unwrap();
        assert_eq!(
            map.get("ADC0", "CDDC0", "FDDC0").unwrap(),
            &names(&["voltage0_i", "voltage0_q"])[..]
        );
    }

    #[test]
    fn unlabeled_channels_are_skipped() {
        let channels = [unlabeled("voltage0_i"), unlabeled("timestamp")];
        let map = PathMap::from_channels(&channels).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn malformed_label_is_an_error() {
        for label in ["FDDC0->ADC0", "A->B->C->D", ""] {
            let channels = [labeled("voltage0_i", label)];
            assert!(PathMap::from_channels(&channels).is_err(), "label {label:?}");
        }
    }

    #[test]
    fn leaves_follow_device_order() {
        let channels = [
            labeled("voltage0_i", "FDDC0->CDDC0->ADC0"),
            labeled("voltage1_i", "FDDC1->CDDC0->ADC0"),
            labeled("voltage2_i", "FDDC0->CDDC0->ADC1"),
        ];
        let map = PathMap::from_channels(&channels).unwrap();
        let leaves: Vec<String> = map
            .leaves()
            .map(|(converter, coarse, fine, _)| format!("{converter}/{coarse}/{fine}"))
            .collect();
        assert_eq!(
            leaves,
            ["ADC0/CDDC0/FDDC0", "ADC0/CDDC0/FDDC1", "ADC1/CDDC0/FDDC0"]
        );
    }

    #[test]
    fn data_sort_interleaves_iq_pairs() {
        let input = names(&["voltage1_q", "voltage0_q", "voltage1_i", "voltage0_i"]);
        let sorted = sort_data_channels(&input).unwrap();
        assert_eq!(
            sorted.names(),
            &names(&["voltage0_i", "voltage0_q", "voltage1_i", "voltage1_q"])[..]
        );
    }

    #[test]
    fn data_sort_uses_numeric_index() {
        let input = names(&[
            "voltage10_i",
            "voltage10_q",
            "voltage2_i",
            "voltage2_q",
        ]);
        let sorted = sort_data_channels(&input).unwrap();
        assert_eq!(
            sorted.names(),
            &names(&["voltage2_i", "voltage2_q", "voltage10_i", "voltage10_q"])[..]
        );
    }

    #[test]
    fn data_sort_rejects_unpaired_channels() {
        let input = names(&["voltage0_i", "voltage0_q", "voltage1_i"]);
        assert!(sort_data_channels(&input).is_err());
    }

    #[test]
    fn dds_sort_is_numeric_without_pairing() {
        let input = names(&["altvoltage3", "altvoltage0", "altvoltage1"]);
        let sorted = sort_dds_channels(&input).unwrap();
        assert_eq!(
            sorted.names(),
            &names(&["altvoltage0", "altvoltage1", "altvoltage3"])[..]
        );
    }

    #[test]
    fn first_inphase_represents_the_coarse_stage() {
        let channels = [
            labeled("voltage0_i", "FDDC0->CDDC0->ADC0"),
            labeled("voltage0_q", "FDDC0->CDDC0->ADC0"),
            labeled("voltage1_i", "FDDC1->CDDC0->ADC0"),
            labeled("voltage1_q", "FDDC1->CDDC0->ADC0"),
        ];
        let map = PathMap::from_channels(&channels).unwrap();
        let stages = StageChannels::from_path_map(&map).unwrap();
        assert_eq!(stages.rx_coarse.names(), &names(&["voltage0_i"])[..]);
        assert_eq!(
            stages.rx_fine.names(),
            &names(&["voltage0_i", "voltage1_i"])[..]
        );
        assert!(stages.tx_coarse.is_empty());
        assert!(stages.tx_fine.is_empty());
    }

    #[test]
    fn non_adc_converters_route_to_the_transmit_side() {
        let channels = [
            labeled("voltage0_i", "FDUC0->CDUC0->DAC0"),
            labeled("voltage0_q", "FDUC0->CDUC0->DAC0"),
        ];
        let map = PathMap::from_channels(&channels).unwrap();
        let stages = StageChannels::from_path_map(&map).unwrap();
        assert!(stages.rx_coarse.is_empty());
        assert!(stages.rx_fine.is_empty());
        assert_eq!(stages.tx_coarse.names(), &names(&["voltage0_i"])[..]);
        assert_eq!(stages.tx_fine.names(), &names(&["voltage0_i"])[..]);
    }

    #[test]
    fn group_without_inphase_channels_is_an_error() {
        let channels = [labeled("voltage0_q", "FDDC0->CDDC0->ADC0")];
        let map = PathMap::from_channels(&channels).unwrap();
        assert!(StageChannels::from_path_map(&map).is_err());
    }
}
