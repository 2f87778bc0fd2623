//! ad9081-iio controls the Analog Devices AD9081 mixed-signal front end
//! (MxFE) through an industrial I/O context. It rebuilds the converter →
//! coarse channelizer → fine channelizer topology from the labels the
//! driver attaches to its channels, and exposes the NCO frequencies and
//! phases of every stage as vectorized accessors whose order matches the
//! discovered channel lists, together with the scalar device controls
//! (test mode, nyquist zone, fast frequency hopping, loopback, sample
//! rates).

#![warn(missing_docs)]

pub mod iio;
pub mod mxfe;
pub mod topology;
