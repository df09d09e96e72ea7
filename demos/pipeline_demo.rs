//! Demonstration of the heartbeat pipeline without a network.
//!
//! This example shows how to:
//! 1. Feed a burst of editor activity through the debouncer
//! 2. Queue the resulting heartbeats
//! 3. Deliver them through a transmitter that is offline at first
//! 4. Read the delivery status and statistics
//!
//! Run with: cargo run --example pipeline_demo

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use editor_heartbeat::{
    activity::ActivityEvent,
    core::{ActivityRecorder, Debouncer},
    dispatch::{BackoffPolicy, Dispatcher, DispatcherOptions, FlushOutcome},
    queue::HeartbeatQueue,
    status::{DeliveryStats, SharedStatus},
    transmit::{MockTransmitter, TransmitError},
    Settings,
};

#[tokio::main]
async fn main() {
    println!("Editor Heartbeat - Pipeline Demo");
    println!("================================");
    println!();

    let queue = Arc::new(HeartbeatQueue::in_memory(1_000));
    let stats = Arc::new(DeliveryStats::new());
    let status = Arc::new(SharedStatus::new());
    let transmitter = Arc::new(MockTransmitter::new());
    transmitter.fail_times(1, TransmitError::network("service unreachable"));

    let mut recorder = ActivityRecorder::new(Debouncer::default(), queue.clone(), stats.clone());

    // Five minutes of typing in two files, one keystroke every 5 seconds
    let start = Utc::now() - ChronoDuration::minutes(5);
    for i in 0..60 {
        let file = if i < 40 { "/work/app/src/main.rs" } else { "/work/app/src/lib.rs" };
        let event = ActivityEvent::edit(file)
            .with_project("app")
            .with_language("Rust")
            .at(start + ChronoDuration::seconds(i * 5));
        recorder.record(&event);
    }
    recorder.record(&ActivityEvent::save("/work/app/src/lib.rs").with_project("app"));

    println!("Heartbeats queued: {}", queue.len());
    println!();

    let mut dispatcher = Dispatcher::new(
        queue.clone(),
        transmitter.clone(),
        status.clone(),
        stats.clone(),
        Settings::default(),
        DispatcherOptions {
            backoff: BackoffPolicy::new(Duration::from_millis(200), Duration::from_secs(2), 0.2),
            ..DispatcherOptions::default()
        },
    );

    loop {
        let report = dispatcher.flush().await;
        println!("{}", status.current());
        match report.outcome {
            FlushOutcome::Retrying { delay } | FlushOutcome::Waiting { remaining: delay } => {
                println!("  retrying in {}ms", delay.as_millis());
                tokio::time::sleep(delay).await;
            }
            _ => break,
        }
    }

    println!();
    println!("Transmitter calls: {}", transmitter.calls());
    for entity in transmitter.delivered_entities() {
        println!("  delivered {entity}");
    }
    println!();
    println!("{}", stats.summary());
}
