//! One worker bound to one chain stage.
//!
//! Every stage runs the same loop; only the bound [`DestinationProperties`]
//! differ. A worker owns its consumer and its redelivery backoff, and shares
//! the publisher and configuration read-only with its siblings.

use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backoff::RepeatingBackoff;
use crate::bus::{BusError, ConsumedRecord, OutgoingRecord, RecordConsumer, RecordPublisher};
use crate::destination::{DestinationProperties, Route, TerminalReason};
use crate::dlt::{DeadLetter, DltStrategy};
use crate::failure::{kinds, ListenerFailure};
use crate::headers::{HeaderError, RetryState, ORIGINAL_TOPIC};
use crate::retrytopic::RetryTopicConfiguration;
use crate::utils::now_millis;
use crate::utils::retry::{is_retryable_bus_error, publish_backoff, PublishRetryConfig};

use super::delay::{wait_until_due, WaitOutcome};
use super::{DispatchError, RecordHandler};

pub(crate) struct StageWorker {
    pub(crate) name: String,
    pub(crate) configuration: Arc<RetryTopicConfiguration>,
    pub(crate) stage_index: usize,
    pub(crate) consumer: Box<dyn RecordConsumer>,
    pub(crate) publisher: Arc<dyn RecordPublisher>,
    pub(crate) handler: Arc<dyn RecordHandler>,
    pub(crate) poll_timeout: Duration,
    pub(crate) publish_retry: PublishRetryConfig,
    pub(crate) redelivery: RepeatingBackoff,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl StageWorker {
    /// Poll and dispatch until shutdown.
    pub(crate) async fn run(mut self) {
        info!(worker = %self.name, "Stage worker started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let polled = tokio::select! {
                polled = self.consumer.poll(self.poll_timeout) => polled,
                _ = self.shutdown.changed() => continue,
            };

            let record = match polled {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(worker = %self.name, error = %e, "Poll failed");
                    if self.pause(self.poll_timeout).await {
                        break;
                    }
                    continue;
                }
            };

            match self.dispatch(&record).await {
                Ok(()) => self.redelivery.reset(),
                Err(DispatchError::Interrupted) => {
                    debug!(
                        worker = %self.name,
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        "Wait interrupted, leaving record unacknowledged"
                    );
                    self.rewind(&record);
                    break;
                }
                Err(e) => {
                    let interval = Duration::from_millis(self.redelivery.next_interval_ms());
                    error!(
                        worker = %self.name,
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        error = %e,
                        retry_in = ?interval,
                        "Record not acknowledged, will be redelivered"
                    );
                    self.rewind(&record);
                    if self.pause(interval).await {
                        break;
                    }
                }
            }
        }

        self.consumer.close().await;
        info!(worker = %self.name, "Stage worker stopped");
    }

    /// Sleep, returning `true` if shutdown was requested meanwhile.
    async fn pause(&mut self, interval: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(interval) => *self.shutdown.borrow(),
            changed = self.shutdown.changed() => changed.is_err() || *self.shutdown.borrow(),
        }
    }

    fn rewind(&mut self, record: &ConsumedRecord) {
        if let Err(e) = self.consumer.rewind(record) {
            error!(worker = %self.name, error = %e, "Rewind failed");
        }
    }

    /// Process one record end to end. `Ok` means it was acknowledged.
    async fn dispatch(&mut self, record: &ConsumedRecord) -> Result<(), DispatchError> {
        let configuration = Arc::clone(&self.configuration);
        let stage = &configuration.chain().stages()[self.stage_index];
        let main_topic = record
            .topic
            .strip_suffix(stage.suffix.as_str())
            .unwrap_or(&record.topic)
            .to_string();

        let state = if stage.is_main() {
            RetryState::first_attempt(record, now_millis())
        } else {
            match RetryState::from_headers(&record.headers) {
                Ok(Some(state)) => state,
                Ok(None) => {
                    let violation = HeaderError::Missing(ORIGINAL_TOPIC);
                    return self
                        .reject(&configuration, record, &main_topic, violation)
                        .await;
                }
                Err(e) => return self.reject(&configuration, record, &main_topic, e).await,
            }
        };

        if let Some(due_at_ms) = state.due_at_ms {
            let outcome =
                wait_until_due(self.consumer.as_mut(), due_at_ms, &mut self.shutdown).await?;
            if outcome == WaitOutcome::Interrupted {
                return Err(DispatchError::Interrupted);
            }
        }

        match self.handler.handle(Arc::new(record.clone())).await {
            Ok(()) => {
                debug!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    "Record processed"
                );
            }
            Err(failure) => {
                self.route_failure(&configuration, stage, record, &main_topic, state, failure)
                    .await?;
            }
        }

        self.consumer.commit(record).await?;
        Ok(())
    }

    async fn route_failure(
        &self,
        configuration: &RetryTopicConfiguration,
        stage: &DestinationProperties,
        record: &ConsumedRecord,
        main_topic: &str,
        state: RetryState,
        failure: ListenerFailure,
    ) -> Result<(), DispatchError> {
        let now = now_millis();
        let attempts = state.attempts.saturating_add(1);
        let route = configuration.resolver().resolve_next(
            stage,
            attempts,
            state.first_attempt_ms,
            &failure,
            now,
        );

        match route {
            Route::Retry(next) => {
                let due_at = now.saturating_add(i64::try_from(next.delay_ms).unwrap_or(i64::MAX));
                let next_state = state.next_hop(&failure, due_at);
                let topic = next.topic_for(main_topic);
                info!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    attempt = attempts,
                    destination = %topic,
                    delay_ms = next.delay_ms,
                    failure = %failure,
                    "Record failed, sending to next retry stage"
                );
                self.republish(record, next, &topic, &next_state).await
            }
            Route::DeadLetter {
                destination,
                reason,
            } => {
                let dead_state = state.next_hop(&failure, now);
                self.dead_letter(
                    configuration,
                    record,
                    destination,
                    main_topic,
                    dead_state,
                    failure,
                    reason,
                )
                .await
            }
            Route::Discard { reason } => {
                error!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    attempt = attempts,
                    reason = %reason,
                    failure = %failure,
                    "Record dropped, no dead-letter topic configured"
                );
                Ok(())
            }
        }
    }

    /// Route a record that arrived without usable retry headers.
    async fn reject(
        &mut self,
        configuration: &RetryTopicConfiguration,
        record: &ConsumedRecord,
        main_topic: &str,
        violation: HeaderError,
    ) -> Result<(), DispatchError> {
        error!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            error = %violation,
            "Retry header protocol violation"
        );

        let failure = ListenerFailure::new(kinds::MISSING_RETRY_HEADERS, violation.to_string());
        let mut state = RetryState::first_attempt(record, now_millis());
        state.original_topic = main_topic.to_string();
        let state = state.next_hop(&failure, now_millis());

        match configuration
            .resolver()
            .dead_letter_for(&failure, TerminalReason::MissingRetryHeaders)
        {
            Route::DeadLetter {
                destination,
                reason,
            } => {
                self.dead_letter(
                    configuration,
                    record,
                    destination,
                    main_topic,
                    state,
                    failure,
                    reason,
                )
                .await?
            }
            _ => warn!(
                topic = %record.topic,
                offset = record.offset,
                "Dropping record with invalid retry headers, no dead-letter topic configured"
            ),
        }

        self.consumer.commit(record).await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn dead_letter(
        &self,
        configuration: &RetryTopicConfiguration,
        record: &ConsumedRecord,
        destination: &DestinationProperties,
        main_topic: &str,
        state: RetryState,
        failure: ListenerFailure,
        reason: TerminalReason,
    ) -> Result<(), DispatchError> {
        let topic = destination.topic_for(main_topic);

        if let Some(handler) = configuration.dlt_handler() {
            let letter = DeadLetter {
                record: record.clone(),
                state: state.clone(),
                failure: failure.clone(),
                reason,
                destination_topic: topic.clone(),
            };
            match handler.handle(letter).await {
                Ok(()) => {
                    info!(
                        topic = %record.topic,
                        offset = record.offset,
                        attempt = state.attempts,
                        reason = %reason,
                        "Dead letter handled"
                    );
                    return Ok(());
                }
                Err(e) if configuration.dlt_strategy() == DltStrategy::AlwaysRetryOnError => {
                    warn!(
                        error = %e,
                        destination = %topic,
                        "Dead-letter handler failed, publishing to dead-letter topic"
                    );
                }
                Err(e) => {
                    error!(
                        topic = %record.topic,
                        offset = record.offset,
                        error = %e,
                        failure = %failure,
                        "Dead-letter handler failed, record acknowledged"
                    );
                    return Ok(());
                }
            }
        }

        info!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            attempt = state.attempts,
            destination = %topic,
            reason = %reason,
            failure = %failure,
            "Sending record to dead-letter topic"
        );
        self.republish(record, destination, &topic, &state).await
    }

    async fn republish(
        &self,
        record: &ConsumedRecord,
        destination: &DestinationProperties,
        topic: &str,
        state: &RetryState,
    ) -> Result<(), DispatchError> {
        let mut headers = record.headers.clone();
        state.apply(&mut headers);
        let outgoing = OutgoingRecord {
            topic: topic.to_string(),
            partition: destination.preserved_partition(record.partition),
            key: record.key.clone(),
            payload: record.payload.clone(),
            headers,
        };

        (|| async { self.publisher.publish(outgoing.clone()).await })
            .retry(publish_backoff(&self.publish_retry))
            .when(is_retryable_bus_error)
            .notify(|err: &BusError, dur: Duration| {
                warn!(destination = %topic, error = %err, delay = ?dur, "Republish failed, retrying");
            })
            .await
            .map_err(|source| DispatchError::Publish {
                topic: topic.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_worker_future_is_send() {
        // Fails to compile if `run` holds a non-Send borrow across an await.
        fn check(worker: StageWorker) {
            let run = worker.run();
            assert_send(&run);
        }
        let _ = check;
    }
}
