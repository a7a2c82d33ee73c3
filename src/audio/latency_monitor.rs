//! Latency monitor.
//!
//! Wraps the frame chain below the resampler and runs the clock-coupling
//! loop: measures the network-incoming-queue latency, feeds it to the
//! frequency estimator on a fixed cadence, clamps the resulting factor, and
//! pushes it into the resampler. Latency out of bounds ends the session;
//! the one tolerated case is under-run with an empty queue, which is left
//! to the watchdog (short bursts recover on their own, the no-playback
//! timeout catches the rest).
//!
//! `reclock` is fed by the device after it reports when the last frame
//! will audibly play; it only updates the end-to-end latency figure.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use super::depacketizer::DepacketizerProbe;
use super::frame::Frame;
use super::freq_estimator::{FeProfile, FreqEstimator};
use super::resampler::ScalingControl;
use super::sample_spec::{SampleSpec, MILLISECOND, SECOND};
use super::FrameReader;
use crate::dbgio::{CsvEntry, CsvProducer};
use crate::packet::sorted_queue::SharedQueue;
use crate::packet::stream_timestamp_diff;
use crate::status::{ConfigError, Status};

/// Interval between latency log lines.
const LOG_INTERVAL: i64 = 5 * SECOND;

#[derive(Debug, Clone)]
pub struct LatencyConfig {
    /// Target queued latency, nanoseconds.
    pub target_latency: i64,
    /// Allowed deviation around the target before the session dies.
    pub latency_tolerance: i64,
    /// Run the frequency estimator and drive the resampler.
    pub fe_enable: bool,
    /// Estimator gain profile.
    pub fe_profile: FeProfile,
    /// Estimator update cadence, nanoseconds of output.
    pub fe_update_interval: i64,
    /// Clamp on the scaling factor around 1.0.
    pub max_scaling_delta: f64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            target_latency: 200 * MILLISECOND,
            latency_tolerance: 100 * MILLISECOND,
            fe_enable: true,
            fe_profile: FeProfile::Responsive,
            fe_update_interval: 5 * MILLISECOND,
            max_scaling_delta: 0.005,
        }
    }
}

/// Latency figures in nanoseconds.
#[derive(Debug, Default, Clone, Copy)]
pub struct LatencyMetrics {
    /// Span between the newest queued packet and the next sample the
    /// depacketizer will produce.
    pub niq_latency: i64,
    /// Sender capture to receiver playback, from `reclock`.
    pub e2e_latency: i64,
}

#[derive(Debug)]
struct SharedState {
    niq_ns: AtomicI64,
    e2e_ns: AtomicI64,
    stream_cts: AtomicI64,
}

/// Cloneable access to the monitor's latency figures, and the entry point
/// for `reclock` when the monitor itself is buried inside the reader chain.
#[derive(Clone)]
pub struct LatencyHandle {
    shared: Arc<SharedState>,
}

impl LatencyHandle {
    pub fn metrics(&self) -> LatencyMetrics {
        LatencyMetrics {
            niq_latency: self.shared.niq_ns.load(Ordering::Relaxed),
            e2e_latency: self.shared.e2e_ns.load(Ordering::Relaxed),
        }
    }

    /// Update the end-to-end latency from the device's reported audible
    /// play-out time of the last frame.
    pub fn reclock(&self, playback_timestamp: i64) -> bool {
        if playback_timestamp < 0 {
            debug_assert!(false, "latency monitor: negative playback timestamp");
            return false;
        }
        let cts = self.shared.stream_cts.load(Ordering::Relaxed);
        if cts != 0 {
            self.shared
                .e2e_ns
                .store(playback_timestamp - cts, Ordering::Relaxed);
        }
        true
    }
}

#[derive(Debug)]
pub struct LatencyMonitor<R: FrameReader> {
    reader: R,
    queue: SharedQueue,
    depacketizer: DepacketizerProbe,
    scaling: Option<Arc<ScalingControl>>,
    fe: Option<FreqEstimator>,
    dumper: Option<CsvProducer>,

    spec: SampleSpec,
    /// Samples per channel emitted so far.
    stream_pos: u64,
    /// Capture timestamp of the most recent frame.
    stream_cts: i64,

    update_interval: u64,
    update_pos: u64,
    report_interval: u64,
    report_pos: u64,

    target_latency: i64,
    min_latency: i64,
    max_latency: i64,
    max_scaling_delta: f64,

    freq_coeff: f64,
    niq_latency: i64,
    has_niq_latency: bool,
    e2e_latency: i64,

    shared: Arc<SharedState>,
    alive: bool,
}

impl<R: FrameReader> LatencyMonitor<R> {
    /// `spec` is the stream spec at this point of the chain (raw f32).
    /// `scaling` must be provided when `config.fe_enable` is set.
    pub fn new(
        reader: R,
        queue: SharedQueue,
        depacketizer: DepacketizerProbe,
        scaling: Option<Arc<ScalingControl>>,
        config: &LatencyConfig,
        spec: SampleSpec,
        dumper: Option<CsvProducer>,
    ) -> Result<Self, ConfigError> {
        let target_latency = spec.ns_2_stream_timestamp_delta(config.target_latency);
        let min_latency =
            spec.ns_2_stream_timestamp_delta(config.target_latency - config.latency_tolerance);
        let max_latency =
            spec.ns_2_stream_timestamp_delta(config.target_latency + config.latency_tolerance);

        debug!(
            "latency monitor: initializing: target={} min={} max={} fe_enable={}",
            target_latency, min_latency, max_latency, config.fe_enable
        );

        if config.target_latency <= 0
            || target_latency < min_latency
            || target_latency > max_latency
        {
            return Err(ConfigError::InvalidLatency {
                target: config.target_latency,
                tolerance: config.latency_tolerance,
            });
        }

        let (fe, update_interval) = if config.fe_enable {
            if config.fe_update_interval <= 0 {
                return Err(ConfigError::InvalidFeInterval(config.fe_update_interval));
            }
            let scaling = scaling
                .as_ref()
                .ok_or(ConfigError::BadScaling(0.0))?;
            if !scaling.set_scaling(1.0) {
                return Err(ConfigError::BadScaling(1.0));
            }
            (
                Some(FreqEstimator::new(
                    config.fe_profile,
                    target_latency.max(1) as u32,
                )),
                spec.ns_2_samples(config.fe_update_interval) as u64,
            )
        } else {
            (None, 0)
        };

        Ok(Self {
            reader,
            queue,
            depacketizer,
            scaling,
            fe,
            dumper,
            spec,
            stream_pos: 0,
            stream_cts: 0,
            update_interval: update_interval.max(1),
            update_pos: 0,
            report_interval: spec.ns_2_samples(LOG_INTERVAL) as u64,
            report_pos: 0,
            target_latency,
            min_latency,
            max_latency,
            max_scaling_delta: config.max_scaling_delta,
            freq_coeff: 1.0,
            niq_latency: 0,
            has_niq_latency: false,
            e2e_latency: 0,
            shared: Arc::new(SharedState {
                niq_ns: AtomicI64::new(0),
                e2e_ns: AtomicI64::new(0),
                stream_cts: AtomicI64::new(0),
            }),
            alive: true,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn handle(&self) -> LatencyHandle {
        LatencyHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn metrics(&self) -> LatencyMetrics {
        LatencyMetrics {
            niq_latency: self.spec.stream_timestamp_delta_2_ns(self.niq_latency),
            e2e_latency: self.spec.stream_timestamp_delta_2_ns(self.e2e_latency),
        }
    }

    /// Called after the device reports the audible play-out time of the
    /// last frame; updates the end-to-end latency figure only.
    pub fn reclock(&mut self, playback_timestamp: i64) -> bool {
        if playback_timestamp < 0 {
            debug_assert!(false, "latency monitor: negative playback timestamp");
            return false;
        }
        if self.stream_cts == 0 {
            return true;
        }

        // Both timestamps are in the receiver clock domain.
        self.e2e_latency = self
            .spec
            .ns_2_stream_timestamp_delta(playback_timestamp - self.stream_cts);
        self.shared
            .e2e_ns
            .store(playback_timestamp - self.stream_cts, Ordering::Relaxed);

        if let Some(dumper) = &self.dumper {
            dumper.write(
                CsvEntry::new('e')
                    .push(self.spec.stream_timestamp_delta_2_ns(self.e2e_latency) as f64
                        / MILLISECOND as f64),
            );
        }
        true
    }

    fn compute_niq_latency(&mut self) {
        if !self.depacketizer.is_started() {
            return;
        }
        let Some(latest) = self.queue.latest() else {
            return;
        };

        // Newest sample anywhere in the packet pipeline vs. the next sample
        // the depacketizer expects; covers packets buffered inside the FEC
        // reader and delayed reader too.
        let niq_head = self.depacketizer.next_timestamp();
        let niq_tail = latest.end();
        self.niq_latency = stream_timestamp_diff(niq_tail, niq_head);
        self.has_niq_latency = true;
        self.shared.niq_ns.store(
            self.spec.stream_timestamp_delta_2_ns(self.niq_latency),
            Ordering::Relaxed,
        );
    }

    fn check_bounds(&self, latency: i64) -> bool {
        if latency < self.min_latency && self.queue.is_empty() {
            // Burst delay or drop: the queue ran dry and the depacketizer is
            // ahead of the last packet. Terminating here would kill sessions
            // that recover in the next few frames; the watchdog owns the
            // decision instead.
            return true;
        }

        if latency < self.min_latency || latency > self.max_latency {
            warn!(
                "latency monitor: latency out of bounds: latency={} target={} min={} max={} \
                 queue={}",
                latency,
                self.target_latency,
                self.min_latency,
                self.max_latency,
                self.queue.len()
            );
            return false;
        }

        true
    }

    fn update_scaling(&mut self, latency: i64) -> bool {
        let latency = latency.clamp(0, u32::MAX as i64) as u32;

        if self.stream_pos < self.update_pos {
            return true;
        }

        let fe = self.fe.as_mut().expect("fe configured");
        while self.stream_pos >= self.update_pos {
            fe.update(latency);
            self.update_pos += self.update_interval;
        }

        self.freq_coeff = fe
            .freq_coeff()
            .clamp(1.0 - self.max_scaling_delta, 1.0 + self.max_scaling_delta);

        let scaling = self.scaling.as_ref().expect("scaling configured");
        if !scaling.set_scaling(self.freq_coeff) {
            warn!(
                "latency monitor: scaling factor rejected: fe={} trimmed={}",
                self.fe.as_ref().map_or(0.0, |f| f.freq_coeff()),
                self.freq_coeff
            );
            return false;
        }

        true
    }

    fn update(&mut self) -> Result<(), Status> {
        if !self.has_niq_latency {
            return Ok(());
        }

        if !self.check_bounds(self.niq_latency) {
            self.alive = false;
            return Err(Status::Finish);
        }

        if self.fe.is_some() && !self.update_scaling(self.niq_latency) {
            self.alive = false;
            return Err(Status::Abort);
        }

        Ok(())
    }

    fn report(&mut self) {
        if !self.has_niq_latency || self.stream_pos < self.report_pos {
            return;
        }
        while self.stream_pos >= self.report_pos {
            self.report_pos += self.report_interval.max(1);
        }

        debug!(
            "latency monitor: e2e={}ms niq={}ms target={}ms fe={:.6}",
            self.spec.stream_timestamp_delta_2_ns(self.e2e_latency) / MILLISECOND,
            self.spec.stream_timestamp_delta_2_ns(self.niq_latency) / MILLISECOND,
            self.spec.stream_timestamp_delta_2_ns(self.target_latency) / MILLISECOND,
            self.freq_coeff
        );

        if let Some(dumper) = &self.dumper {
            dumper.write(
                CsvEntry::new('m')
                    .push(self.spec.stream_timestamp_delta_2_ns(self.niq_latency) as f64
                        / MILLISECOND as f64)
                    .push(self.freq_coeff),
            );
        }
    }
}

impl<R: FrameReader> FrameReader for LatencyMonitor<R> {
    fn read(&mut self, frame: &mut Frame) -> Result<(), Status> {
        if !self.alive {
            return Err(Status::Finish);
        }

        self.compute_niq_latency();
        self.update()?;

        self.reader.read(frame)?;

        self.stream_pos += frame.duration() as u64;
        if frame.capture_timestamp() != 0 {
            self.stream_cts = frame.capture_timestamp();
            self.shared
                .stream_cts
                .store(self.stream_cts, Ordering::Relaxed);
        }

        self.report();
        Ok(())
    }
}
