use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec};

pub static BROADCASTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "chorus_broadcaster_submissions_total",
        "Signed duty objects submitted to the beacon node",
        &["kind"]
    )
    .expect("metric can be created")
});

pub static BROADCAST_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "chorus_broadcaster_failures_total",
        "Signed duty objects that could not be submitted",
        &["kind"]
    )
    .expect("metric can be created")
});
