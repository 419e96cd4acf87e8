//! Running the producer and consumer loops on their own threads.

use std::sync::Arc;
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};

use anyhow::Context;
use futures_channel::oneshot;
use tracing::{debug, info};

use crate::Result;
use crate::analyzer::{ConsumerLoop, ProducerLoop};
use crate::backing::StoreStats;
use crate::capture::{CaptureStats, Settings};
use crate::cdc::{ConsumerStats, ProducerStats, cross_domain_queue};
use crate::control::ControlRegisters;
use crate::engine::EngineStats;
use crate::report::ReportStream;
use crate::sample::{Sample, SampleSource};
use crate::util::{join_worker, stop_requested};

struct ProducerReport {
    engine: EngineStats,
    queue: ProducerStats,
    ticks: u64,
}

struct ConsumerReport {
    queue: ConsumerStats,
    store: Option<StoreStats>,
    discarded: u64,
}

/// Handle used to stop the capture threads.
pub struct CaptureStop {
    producer_stop: oneshot::Sender<()>,
    consumer_stop: oneshot::Sender<()>,
    producer: JoinHandle<Result<ProducerReport>>,
    consumer: JoinHandle<Result<ConsumerReport>>,
}

impl CaptureStop {
    /// Stop both loops now, dropping anything not yet sent.
    pub fn stop(self) -> Result<CaptureStats> {
        info!("Stopping capture threads");
        // Either may already have finished by itself.
        let _ = self.producer_stop.send(());
        let _ = self.consumer_stop.send(());
        Self::join(self.producer, self.consumer)
    }

    /// Wait for both loops to finish by themselves: the sample source
    /// running dry and everything it produced having been sent.
    pub fn wait(self) -> Result<CaptureStats> {
        let CaptureStop { producer_stop, consumer_stop, producer, consumer } = self;
        let stats = Self::join(producer, consumer);
        drop((producer_stop, consumer_stop));
        stats
    }

    fn join(
        producer: JoinHandle<Result<ProducerReport>>,
        consumer: JoinHandle<Result<ConsumerReport>>,
    ) -> Result<CaptureStats> {
        let producer = join_worker("Producer", producer);
        let consumer = join_worker("Consumer", consumer);
        let (producer, consumer) = (producer?, consumer?);
        Ok(CaptureStats {
            engine: producer.engine,
            queue_producer: producer.queue,
            queue_consumer: consumer.queue,
            store: consumer.store,
            discarded: consumer.discarded,
            ticks: producer.ticks,
        })
    }
}

/// Start the loops on their own threads, feeding them from `source`.
pub fn spawn<S>(
    settings: &Settings,
    control: Arc<ControlRegisters>,
    source: S,
) -> Result<(ReportStream, CaptureStop)>
where
    S: SampleSource + Send + 'static,
{
    let (queue_producer, queue_consumer) = cross_domain_queue(settings.queue_depth)?;
    let producer = ProducerLoop::new(settings, control, queue_producer)?;
    let consumer = ConsumerLoop::new(settings, queue_consumer)?;
    let (data_tx, data_rx) = mpsc::sync_channel(settings.report_channel_depth);
    let (producer_stop, producer_stop_rx) = oneshot::channel();
    let (consumer_stop, consumer_stop_rx) = oneshot::channel();
    let batch = settings.report_batch;

    let producer = thread::Builder::new()
        .name("capture-producer".to_string())
        .spawn(move || run_producer(producer, source, producer_stop_rx))
        .context("Failed to start producer thread")?;
    let consumer = thread::Builder::new()
        .name("capture-consumer".to_string())
        .spawn(move || run_consumer(consumer, data_tx, batch, consumer_stop_rx))
        .context("Failed to start consumer thread")?;

    info!(queue_depth = settings.queue_depth, "Capture threads started");
    let stream = ReportStream::new(data_rx, settings.clock_hz);
    let stop = CaptureStop { producer_stop, consumer_stop, producer, consumer };
    Ok((stream, stop))
}

fn run_producer<S: SampleSource>(
    mut producer: ProducerLoop,
    mut source: S,
    mut stop_rx: oneshot::Receiver<()>,
) -> Result<ProducerReport> {
    let mut quiet = Sample::default();
    while !stop_requested(&mut stop_rx) {
        match source.next_sample() {
            Some(sample) => {
                producer.tick(&sample);
                quiet = Sample { rx_active: false, data_valid: false, ..sample };
            }
            // Out of samples: hold the bus quiet until the ring is handed over.
            None if !producer.is_drained() => {
                producer.tick(&quiet);
            }
            None => break,
        }
    }
    debug!(ticks = producer.ticks(), "Producer loop finished");
    Ok(ProducerReport {
        engine: producer.engine_stats().clone(),
        queue: producer.queue_stats().clone(),
        ticks: producer.ticks(),
    })
}

fn run_consumer(
    mut consumer: ConsumerLoop,
    data_tx: SyncSender<Vec<u8>>,
    batch_size: usize,
    mut stop_rx: oneshot::Receiver<()>,
) -> Result<ConsumerReport> {
    let mut batch = Vec::with_capacity(batch_size);
    while !stop_requested(&mut stop_rx) {
        let ready = batch.len() < batch_size;
        let byte = consumer.tick(ready);
        if let Some(byte) = byte {
            batch.push(byte.payload);
        }
        let finished = consumer.is_finished();
        if !batch.is_empty() && (!ready || byte.is_none() || finished) {
            match data_tx.try_send(std::mem::take(&mut batch)) {
                Ok(()) => {}
                // The reader is behind; hold on to the data, which stalls
                // the queue behind us.
                Err(TrySendError::Full(unsent)) => {
                    batch = unsent;
                    thread::yield_now();
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!("Report stream dropped");
                    break;
                }
            }
        } else if finished {
            break;
        } else if byte.is_none() {
            thread::yield_now();
        }
    }
    debug!("Consumer loop finished");
    Ok(ConsumerReport {
        queue: consumer.queue_stats().clone(),
        store: consumer.store_stats().cloned(),
        discarded: consumer.discarded(),
    })
}
