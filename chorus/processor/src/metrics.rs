use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, register_int_gauge_vec,
    HistogramVec, IntCounterVec, IntGauge, IntGaugeVec,
};

pub static WORK_EVENTS_SUBMITTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "chorus_processor_work_events_submitted_total",
        "Work items submitted to the processor",
        &["type"]
    )
    .expect("metric can be created")
});

pub static WORK_EVENTS_STARTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "chorus_processor_work_events_started_total",
        "Work items started by the processor",
        &["type"]
    )
    .expect("metric can be created")
});

pub static WORK_EVENTS_EXPIRED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "chorus_processor_work_events_expired_total",
        "Work items dropped because their expiry passed before starting",
        &["type"]
    )
    .expect("metric can be created")
});

pub static SEND_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "chorus_processor_send_errors_total",
        "Work items rejected at submission",
        &["type"]
    )
    .expect("metric can be created")
});

pub static QUEUE_LENGTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "chorus_processor_queue_length",
        "Current length of each processor queue",
        &["type"]
    )
    .expect("metric can be created")
});

pub static WORKERS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "chorus_processor_workers_active",
        "Currently active workers"
    )
    .expect("metric can be created")
});

pub static WORKER_TIME: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "chorus_processor_worker_seconds",
        "Time taken by each work item",
        &["type"]
    )
    .expect("metric can be created")
});
