//! Asynchronous CSV dumper.
//!
//! Pipeline components hand entries to a producer handle; a background
//! thread formats and writes them to a file. The two sides meet at the
//! lock-free SPSC ring, so the pipeline never blocks on disk: when the ring
//! is full the entry is dropped.

use std::fs::File;
use std::io::{BufWriter, Write as IoWrite};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::core::spsc::{ring, RingConsumer, RingProducer};
use crate::status::ConfigError;

/// Maximum fields per entry.
pub const MAX_FIELDS: usize = 10;

/// One line in the output file: a one-character type tag plus numeric
/// fields.
#[derive(Debug, Clone, Copy)]
pub struct CsvEntry {
    pub kind: char,
    pub n_fields: usize,
    pub fields: [f64; MAX_FIELDS],
}

impl CsvEntry {
    pub fn new(kind: char) -> Self {
        Self {
            kind,
            n_fields: 0,
            fields: [0.0; MAX_FIELDS],
        }
    }

    pub fn push(mut self, value: f64) -> Self {
        if self.n_fields < MAX_FIELDS {
            self.fields[self.n_fields] = value;
            self.n_fields += 1;
        }
        self
    }
}

/// Dumper configuration.
#[derive(Debug, Clone)]
pub struct CsvConfig {
    /// Path of the output CSV file.
    pub dump_file: String,
    /// Ring capacity; entries beyond it are dropped.
    pub max_queued: usize,
    /// Minimum interval between entries of the same type, nanoseconds.
    /// Zero disables rate limiting.
    pub max_interval_ns: i64,
}

impl Default for CsvConfig {
    fn default() -> Self {
        Self {
            dump_file: String::new(),
            max_queued: 1024,
            max_interval_ns: 0,
        }
    }
}

#[derive(Debug)]
struct ProducerShared {
    ring: Mutex<RingProducer<CsvEntry>>,
    /// Last accepted entry per type tag, for rate limiting.
    last_write: Mutex<Vec<(char, Instant)>>,
    max_interval: Duration,
    overflow_logged: AtomicBool,
}

/// Cloneable write side handed to pipeline components. All writers live on
/// the pipeline side; the mutex around the ring producer is uncontended in
/// steady state and held only for the push itself.
#[derive(Clone, Debug)]
pub struct CsvProducer {
    shared: Arc<ProducerShared>,
}

impl CsvProducer {
    /// Queue an entry; drops it silently when the ring is full or the
    /// entry type is rate-limited.
    pub fn write(&self, entry: CsvEntry) {
        if !self.shared.max_interval.is_zero() {
            let mut last = self.shared.last_write.lock();
            let now = Instant::now();
            match last.iter_mut().find(|(kind, _)| *kind == entry.kind) {
                Some((_, at)) => {
                    if now.duration_since(*at) < self.shared.max_interval {
                        return;
                    }
                    *at = now;
                }
                None => last.push((entry.kind, now)),
            }
        }

        if !self.shared.ring.lock().push_back(entry)
            && !self.shared.overflow_logged.swap(true, Ordering::Relaxed)
        {
            debug!("csv dumper: queue overflow, dropping entries");
        }
    }
}

/// Owns the writer thread; join on drop.
pub struct CsvDumper {
    producer: CsvProducer,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CsvDumper {
    /// Open the output file and start the writer thread.
    pub fn start(config: CsvConfig) -> Result<Self, ConfigError> {
        let file = File::create(&config.dump_file)
            .map_err(|e| ConfigError::Io(format!("{}: {}", config.dump_file, e)))?;

        let (producer, consumer) = ring::<CsvEntry>(config.max_queued.max(1));
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("csv-dumper".into())
                .spawn(move || run_dumper(file, consumer, stop))
                .map_err(|e| ConfigError::Io(e.to_string()))?
        };

        Ok(Self {
            producer: CsvProducer {
                shared: Arc::new(ProducerShared {
                    ring: Mutex::new(producer),
                    last_write: Mutex::new(Vec::new()),
                    max_interval: Duration::from_nanos(config.max_interval_ns.max(0) as u64),
                    overflow_logged: AtomicBool::new(false),
                }),
            },
            stop,
            thread: Some(thread),
        })
    }

    /// Write side for pipeline components.
    pub fn producer(&self) -> CsvProducer {
        self.producer.clone()
    }

    /// Stop the writer thread, flushing queued entries first.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for CsvDumper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_dumper(file: File, mut consumer: RingConsumer<CsvEntry>, stop: Arc<AtomicBool>) {
    let mut out = BufWriter::new(file);
    let mut line = String::with_capacity(128);

    loop {
        let mut wrote = false;
        while let Some(entry) = consumer.pop_front() {
            line.clear();
            line.push(entry.kind);
            for f in &entry.fields[..entry.n_fields] {
                line.push(',');
                // Integral values print without a trailing ".0".
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    line.push_str(&format!("{}", *f as i64));
                } else {
                    line.push_str(&format!("{}", f));
                }
            }
            line.push('\n');
            if out.write_all(line.as_bytes()).is_err() {
                warn!("csv dumper: write failed, stopping");
                return;
            }
            wrote = true;
        }

        if wrote {
            let _ = out.flush();
        }

        if stop.load(Ordering::SeqCst) && consumer.is_empty() {
            let _ = out.flush();
            return;
        }

        std::thread::sleep(Duration::from_millis(1));
    }
}
