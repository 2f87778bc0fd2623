//! Phased-array beam-steering demo.
//!
//! Drives an AD9081-based receive array: the coarse DDC NCOs are tuned to
//! the signal of interest and the per-element fine DDC NCO phases are
//! swept so that the digital beam scans across boresight, reporting the
//! combined power against steering angle. `cal` mode measures per-element
//! gain and phase corrections against a source at boresight and stores
//! them as JSON files; `plot` mode loads those files if they are present
//! (falling back to a flat calibration) and runs the sweep.

use ad9081_iio::mxfe::{Ad9081, RX_DEVICE};
use anyhow::{Context, Result};
use clap::Parser;
use industrial_io as iio;
use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    thread,
    time::Duration,
};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Phased-array demo CLI arguments.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// IIO context URI of the array
    #[clap(long, default_value = "ip:analog.local")]
    uri: String,
    /// Operating mode
    #[clap(value_enum, default_value = "plot")]
    mode: Mode,
    /// Signal frequency in Hz at the antenna elements
    #[clap(long, default_value_t = 10.497e9)]
    signal_frequency: f64,
    /// Coarse DDC NCO frequency in Hz
    #[clap(long, default_value_t = 1_000_000_000)]
    nco_frequency: i64,
    /// Antenna element spacing in meters
    #[clap(long, default_value_t = 0.015)]
    spacing: f64,
    /// Number of captures averaged per measurement
    #[clap(long, default_value_t = 8)]
    averages: usize,
    /// Capture size in samples per channel
    #[clap(long, default_value_t = 1024)]
    buffer_size: usize,
    /// Gain calibration file
    #[clap(long, default_value = "gain_cal.json")]
    gain_cal: PathBuf,
    /// Phase calibration file
    #[clap(long, default_value = "phase_cal.json")]
    phase_cal: PathBuf,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Sweep the beam and report power vs steering angle
    Plot,
    /// Measure gain and phase calibration and save it
    Cal,
}

/// Per-element amplitude corrections, multiplied into the captures.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct GainCal {
    gains: Vec<f64>,
}

/// Per-element phase corrections in millidegrees, added to the steering
/// phases written to the fine DDC NCOs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct PhaseCal {
    phases_mdeg: Vec<i64>,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let ctx = iio::Context::from_uri(&args.uri)
        .with_context(|| format!("failed to open IIO context {}", args.uri))?;
    let mxfe = Ad9081::from_context(&ctx)?;

    for (converter, coarse, fine, channels) in mxfe.path_map().leaves() {
        debug!(%converter, %coarse, %fine, ?channels, "path map leaf");
    }
    info!(
        rx_sampling_frequency = mxfe.get_rx_sampling_frequency()?,
        adc_frequency = mxfe.get_adc_frequency()?,
        "connected to {}",
        args.uri
    );

    let elements = init_front_end(&mxfe, &args)?;
    anyhow::ensure!(elements > 0, "the device reports no receive fine DDC channels");
    info!(elements, "front end configured");

    let (device, channels) = open_capture(&ctx, mxfe.rx_channels().names())?;
    anyhow::ensure!(
        channels.len() == 2 * elements,
        "{} capture channels for {elements} steerable elements",
        channels.len()
    );
    let mut buffer = device
        .create_buffer(args.buffer_size, false)
        .context("failed to create capture buffer")?;

    match args.mode {
        Mode::Cal => calibrate(&mxfe, &mut buffer, &channels, &args, elements),
        Mode::Plot => {
            let gain_cal = load_gain_cal(&args.gain_cal, elements);
            let phase_cal = load_phase_cal(&args.phase_cal, elements);
            sweep(&mxfe, &mut buffer, &channels, &args, &gain_cal, &phase_cal)
        }
    }
}

/// Tunes the NCOs for the sweep and returns the number of steerable
/// elements (one per receive fine DDC).
fn init_front_end(mxfe: &Ad9081, args: &Args) -> Result<usize> {
    let coarse = mxfe.get_rx_main_nco_frequencies()?.len();
    mxfe.set_rx_main_nco_frequencies(&vec![args.nco_frequency; coarse])?;
    mxfe.set_rx_main_nco_phases(&vec![0; coarse])?;

    let elements = mxfe.get_rx_channel_nco_frequencies()?.len();
    mxfe.set_rx_channel_nco_frequencies(&vec![0; elements])?;
    mxfe.set_rx_channel_nco_phases(&vec![0; elements])?;
    Ok(elements)
}

/// Finds the receive data device and enables its data channels.
fn open_capture(ctx: &iio::Context, names: &[String]) -> Result<(iio::Device, Vec<iio::Channel>)> {
    let device = ctx
        .find_device(RX_DEVICE)
        .ok_or_else(|| anyhow::anyhow!("IIO device {RX_DEVICE} not found"))?;
    let mut channels = Vec::with_capacity(names.len());
    for name in names {
        let chan = device
            .find_channel(name, false)
            .ok_or_else(|| anyhow::anyhow!("no input channel {name} on {RX_DEVICE}"))?;
        chan.enable();
        channels.push(chan);
    }
    Ok((device, channels))
}

/// Captures one buffer and returns the complex samples of each element.
///
/// The channel slice is I/Q interleaved, so consecutive pairs form one
/// element.
fn capture_elements(
    buffer: &mut iio::Buffer,
    channels: &[iio::Channel],
) -> Result<Vec<Vec<Complex32>>> {
    buffer.refill().context("failed to refill capture buffer")?;
    let mut elements = Vec::with_capacity(channels.len() / 2);
    for pair in channels.chunks(2) {
        let i = pair[0].read::<i16>(buffer)?;
        let q = pair[1].read::<i16>(buffer)?;
        elements.push(
            i.iter()
                .zip(&q)
                .map(|(&i, &q)| Complex32::new(i as f32, q as f32))
                .collect(),
        );
    }
    Ok(elements)
}

/// Measures per-element gain and phase against a source at boresight and
/// writes the calibration files.
fn calibrate(
    mxfe: &Ad9081,
    buffer: &mut iio::Buffer,
    channels: &[iio::Channel],
    args: &Args,
    elements: usize,
) -> Result<()> {
    println!("place a source at mechanical boresight in front of the array");
    mxfe.set_rx_channel_nco_phases(&vec![0; elements])?;
    thread::sleep(Duration::from_millis(250));

    let mut amplitudes = vec![0.0f64; elements];
    let mut cross = vec![Complex32::new(0.0, 0.0); elements];
    for _ in 0..args.averages {
        let captures = capture_elements(buffer, channels)?;
        let reference = &captures[0];
        for (k, samples) in captures.iter().enumerate() {
            amplitudes[k] += samples.iter().map(|x| x.norm() as f64).sum::<f64>()
                / samples.len() as f64;
            cross[k] += samples
                .iter()
                .zip(reference)
                .map(|(x, r)| x * r.conj())
                .sum::<Complex32>();
        }
    }

    let strongest = amplitudes.iter().cloned().fold(f64::MIN, f64::max);
    let gains: Vec<f64> = amplitudes
        .iter()
        .map(|&a| {
            anyhow::ensure!(a > 0.0, "an element produced no signal during calibration");
            Ok(strongest / a)
        })
        .collect::<Result<_>>()?;
    // Phase corrections are written to the NCOs, so they carry the
    // opposite sign of the measured offsets.
    let phases_mdeg: Vec<i64> = cross
        .iter()
        .map(|c| wrap_mdeg(-(c.arg().to_degrees() as f64 * 1000.0).round() as i64))
        .collect();

    for (k, (gain, phase)) in gains.iter().zip(&phases_mdeg).enumerate() {
        info!(element = k, gain, phase_mdeg = phase, "calibration");
    }

    std::fs::write(
        &args.gain_cal,
        serde_json::to_string_pretty(&GainCal { gains })?,
    )
    .with_context(|| format!("failed to write {}", args.gain_cal.display()))?;
    std::fs::write(
        &args.phase_cal,
        serde_json::to_string_pretty(&PhaseCal { phases_mdeg })?,
    )
    .with_context(|| format!("failed to write {}", args.phase_cal.display()))?;
    println!(
        "calibration saved to {} and {}",
        args.gain_cal.display(),
        args.phase_cal.display()
    );
    Ok(())
}

/// Sweeps the beam across ±90° and prints combined power per angle.
fn sweep(
    mxfe: &Ad9081,
    buffer: &mut iio::Buffer,
    channels: &[iio::Channel],
    args: &Args,
    gain_cal: &GainCal,
    phase_cal: &PhaseCal,
) -> Result<()> {
    let elements = gain_cal.gains.len();
    let mut results = Vec::new();
    for angle in (-90..=90).step_by(2) {
        let mut phases = steering_phases(angle as f64, elements, args);
        for (phase, cal) in phases.iter_mut().zip(&phase_cal.phases_mdeg) {
            *phase = wrap_mdeg(*phase + cal);
        }
        mxfe.set_rx_channel_nco_phases(&phases)?;
        thread::sleep(Duration::from_millis(10));

        let mut power = 0.0;
        for _ in 0..args.averages {
            let captures = capture_elements(buffer, channels)?;
            power += beam_power(&captures, &gain_cal.gains);
        }
        let db = 10.0 * (power / args.averages as f64).log10();
        debug!(angle, power_db = db, "steering step");
        results.push((angle, db));
    }

    println!("angle_deg  power_db");
    for (angle, db) in &results {
        println!("{angle:>9}  {db:>8.2}");
    }
    if let Some((angle, db)) = results
        .iter()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
    {
        println!("peak {db:.2} dB at {angle}°");
    }
    Ok(())
}

/// Phase shifts in millidegrees steering the beam to `angle_deg`.
fn steering_phases(angle_deg: f64, elements: usize, args: &Args) -> Vec<i64> {
    let delta = 360.0 * args.spacing * args.signal_frequency * angle_deg.to_radians().sin()
        / SPEED_OF_LIGHT;
    (0..elements)
        .map(|k| wrap_mdeg(-(delta * k as f64 * 1000.0).round() as i64))
        .collect()
}

/// Mean power of the calibrated, combined beam.
fn beam_power(elements: &[Vec<Complex32>], gains: &[f64]) -> f64 {
    let len = elements.iter().map(Vec::len).min().unwrap_or(0);
    if len == 0 {
        return 0.0;
    }
    (0..len)
        .map(|t| {
            elements
                .iter()
                .zip(gains)
                .map(|(x, &g)| x[t] * g as f32)
                .sum::<Complex32>()
                .norm_sqr() as f64
        })
        .sum::<f64>()
        / len as f64
}

fn wrap_mdeg(phase: i64) -> i64 {
    (phase + 180_000).rem_euclid(360_000) - 180_000
}

fn load_gain_cal(path: &Path, elements: usize) -> GainCal {
    match std::fs::read_to_string(path).map_err(anyhow::Error::from).and_then(|s| {
        serde_json::from_str::<GainCal>(&s).map_err(anyhow::Error::from)
    }) {
        Ok(cal) if cal.gains.len() == elements => cal,
        Ok(cal) => {
            warn!(
                "{} holds {} gains for {elements} elements; using a flat calibration",
                path.display(),
                cal.gains.len()
            );
            GainCal {
                gains: vec![1.0; elements],
            }
        }
        Err(err) => {
            warn!(
                "no gain calibration at {} ({err}); using a flat calibration",
                path.display()
            );
            GainCal {
                gains: vec![1.0; elements],
            }
        }
    }
}

fn load_phase_cal(path: &Path, elements: usize) -> PhaseCal {
    match std::fs::read_to_string(path).map_err(anyhow::Error::from).and_then(|s| {
        serde_json::from_str::<PhaseCal>(&s).map_err(anyhow::Error::from)
    }) {
        Ok(cal) if cal.phases_mdeg.len() == elements => cal,
        Ok(cal) => {
            warn!(
                "{} holds {} phases for {elements} elements; using a flat calibration",
                path.display(),
                cal.phases_mdeg.len()
            );
            PhaseCal {
                phases_mdeg: vec![0; elements],
            }
        }
        Err(err) => {
            warn!(
                "no phase calibration at {} ({err}); using a flat calibration",
                path.display()
            );
            PhaseCal {
                phases_mdeg: vec![0; elements],
            }
        }
    }
}
