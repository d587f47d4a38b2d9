use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, register_int_gauge, IntCounterVec, IntGauge};

pub static CURRENT_SLOT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("chorus_scheduler_current_slot", "Current beacon slot")
        .expect("metric can be created")
});

pub static DUTIES_EMITTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "chorus_scheduler_duties_emitted_total",
        "Duty definitions emitted into the pipeline",
        &["kind"]
    )
    .expect("metric can be created")
});
