//! Minimal run‑time metrics sink.
//!
//! No exporter is bundled; the host process may register a raw callback
//! that receives NUL-terminated metric names and values.

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Recorder, SharedString, Unit};
use once_cell::sync::OnceCell;
use std::ffi::CString;
use std::os::raw::{c_char, c_ulonglong};
use std::sync::Arc;

/// Signature for external collectors.
pub type StatsCallback = unsafe extern "C" fn(name: *const c_char, value: c_ulonglong);

static CALLBACK: OnceCell<StatsCallback> = OnceCell::new();

/// Register a callback from C/other languages. Only the first registration
/// takes effect. Installs the recorder if no set has done so yet.
#[no_mangle]
pub extern "C" fn ipset_register_stats_callback(cb: StatsCallback) {
    let _ = CALLBACK.set(cb);
    init();
}

/// Forwarding recorder. Uses the callback **if** it was registered.
struct FfiRecorder;

/// One registered metric; the name is kept as a C string for the callback.
struct FfiMetric {
    name: CString,
}

impl FfiMetric {
    fn new(key: &Key) -> Arc<Self> {
        // Metric names never contain NUL; fall back to an empty name if one does.
        let name = CString::new(key.name()).unwrap_or_default();
        Arc::new(FfiMetric { name })
    }

    fn emit(&self, value: u64) {
        if let Some(cb) = CALLBACK.get() {
            unsafe { cb(self.name.as_ptr(), value as c_ulonglong) };
        }
    }
}

impl Recorder for FfiRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &metrics::Metadata<'_>) -> Counter {
        Counter::from_arc(FfiMetric::new(key))
    }
    fn register_gauge(&self, key: &Key, _metadata: &metrics::Metadata<'_>) -> Gauge {
        Gauge::from_arc(FfiMetric::new(key))
    }
    fn register_histogram(&self, key: &Key, _metadata: &metrics::Metadata<'_>) -> Histogram {
        Histogram::from_arc(FfiMetric::new(key))
    }
}

impl metrics::CounterFn for FfiMetric {
    fn increment(&self, value: u64) {
        self.emit(value);
    }
    fn absolute(&self, value: u64) {
        self.emit(value);
    }
}

// Gauges report their new value, truncated; deltas are forwarded as-is.
impl metrics::GaugeFn for FfiMetric {
    fn set(&self, value: f64) {
        self.emit(value as u64);
    }
    fn increment(&self, value: f64) {
        self.emit(value as u64);
    }
    fn decrement(&self, value: f64) {
        self.emit(value as u64);
    }
}

impl metrics::HistogramFn for FfiMetric {
    fn record(&self, value: f64) {
        self.emit(value as u64);
    }
}

/// Install exactly **once**; called whenever a set is created or loaded.
pub fn init() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = metrics::set_global_recorder(FfiRecorder);
    });
}
