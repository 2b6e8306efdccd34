//! Two-stream pipeline demo on the software queue.
//!
//! Shows the full dispatch path without hardware: a producer stream runs a
//! kernel, records an event, and a consumer stream orders itself behind it
//! before copying results out.
//!
//! ```bash
//! cargo run --example stream_pipeline
//! ```

use bytes::Bytes;
use kestrel_runtime::{Command, ContextConfig, Event, Runtime, StreamKind};
use std::time::Duration;

fn main() -> kestrel_runtime::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let rt = Runtime::new();
    let ctx = rt.register_context(0, &ContextConfig::software(8, Duration::from_millis(10)))?;

    let producer = rt.stream(rt.create_stream(ctx)?)?;
    let consumer = rt.stream(rt.create_stream(ctx)?)?;

    // Producer: launch a kernel, then mark the point its results exist
    let launch = Command::kernel("vadd", Bytes::from_static(&[0x10, 0, 0, 0, 0x20, 0, 0, 0]));
    producer.enqueue(&launch)?;

    let results_ready = Event::new();
    results_ready.record(&producer)?;

    // Consumer: refuse to copy until the producer's work retired
    consumer.wait_on(&results_ready)?;
    let copy = Command::copy(Bytes::from_static(b"result block"), 0x4000);
    consumer.enqueue(&copy)?;

    consumer.synchronize()?;
    println!(
        "kernel {:?}, copy {:?} ({:?} streams serialized via event)",
        launch.state(),
        copy.state(),
        StreamKind::User,
    );

    let stamp = results_ready.timestamp_ns()?;
    println!("results were ready at t+{}ns", stamp);
    Ok(())
}
