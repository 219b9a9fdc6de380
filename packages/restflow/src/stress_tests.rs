//! Stress tests for the scheduler, queue and emitter under interleavings.
//!
//! Latencies are randomised so launch and settlement orders vary per run.

#[cfg(test)]
mod stress_tests {
    use crate::config::SchedulerConfig;
    use crate::error::RestError;
    use crate::events::{names, EventEmitter, RestEvent};
    use crate::queue::AsyncQueue;
    use crate::request::{Request, RequestId};
    use crate::scheduler::Scheduler;
    use crate::testing::{EventRecorder, MockReply, MockTransport};
    use futures::StreamExt;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    // ==========================================================================
    // Helpers
    // ==========================================================================

    fn jittery(max_ms: u64) -> Arc<MockTransport> {
        Arc::new(MockTransport::new(move |options, _| {
            MockReply::delayed(
                Duration::from_millis(fastrand::u64(1..=max_ms)),
                MockReply::json(json!(options.url.path())),
            )
        }))
    }

    fn scheduler(max_active: usize, transport: Arc<MockTransport>) -> Scheduler {
        Scheduler::new(
            SchedulerConfig::default().with_max_active_requests(max_active),
            transport,
        )
        .unwrap()
    }

    fn requests(n: usize) -> Vec<Request> {
        (0..n)
            .map(|i| Request::get(format!("http://svc/item/{i}")))
            .collect()
    }

    // ==========================================================================
    // Capacity
    // ==========================================================================

    /// Five requests, two slots: never more than two started-but-not-completed.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_capacity_bound_holds_under_jitter() {
        let transport = jittery(15);
        let s = scheduler(2, transport.clone());

        let open = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        {
            let open = open.clone();
            let peak = peak.clone();
            s.events().on_each(
                &[names::REQUEST_START, names::REQUEST_COMPLETE],
                move |event: &RestEvent| match event {
                    RestEvent::Start { .. } => {
                        let now = open.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                    }
                    _ => {
                        open.fetch_sub(1, Ordering::SeqCst);
                    }
                },
            );
        }

        let values = s.collect(requests(5)).await.unwrap();

        assert_eq!(values.len(), 5);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(transport.peak_inflight() <= 2);
        assert_eq!(transport.calls(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_requests_all_settle() {
        let transport = jittery(5);
        let s = scheduler(7, transport.clone());

        let batch = s.run(requests(60), true).await.unwrap();

        assert!(batch.handles().iter().all(|h| h.is_complete()));
        assert!(transport.peak_inflight() <= 7);
        assert_eq!(s.active_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_launch_order_is_submission_order() {
        let transport = jittery(3);
        let s = scheduler(1, transport.clone());

        let batch = s.run(requests(8), true).await.unwrap();
        assert_eq!(batch.len(), 8);

        let paths: Vec<String> = transport
            .requests()
            .iter()
            .map(|o| o.url.path().to_string())
            .collect();
        let expected: Vec<String> = (0..8).map(|i| format!("/item/{i}")).collect();
        assert_eq!(paths, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submitters() {
        let transport = jittery(4);
        let s = scheduler(3, transport.clone());

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let s = s.clone();
                tokio::spawn(async move { s.collect(requests(5)).await })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().len(), 5);
        }
        assert_eq!(transport.calls(), 30);
        assert!(transport.peak_inflight() <= 3);
    }

    // ==========================================================================
    // Failure containment
    // ==========================================================================

    #[tokio::test]
    async fn test_ignored_errors_never_reach_error_listeners() {
        let transport = Arc::new(MockTransport::new(|options, _| {
            if options.url.path().ends_with('3') {
                MockReply::status(404)
            } else {
                MockReply::json(json!(1))
            }
        }));
        let s = scheduler(2, transport);
        let recorder = EventRecorder::attach(
            s.events(),
            &[names::ERROR, names::REQUEST_ERROR_IGNORED],
        );

        let batch: Vec<Request> = requests(5)
            .into_iter()
            .map(|r| r.ignore_status([404]))
            .collect();
        let values = s.collect(batch).await.unwrap();

        assert_eq!(values.len(), 4);
        assert_eq!(recorder.count(names::ERROR), 0);
        assert_eq!(recorder.count(names::REQUEST_ERROR_IGNORED), 1);
    }

    #[tokio::test]
    async fn test_retry_scenario_through_scheduler() {
        let transport = Arc::new(MockTransport::sequence(vec![
            MockReply::fail(RestError::transport("connection reset")),
            MockReply::fail(RestError::Timeout(Duration::from_millis(5))),
            MockReply::json(json!({"ok": true})),
        ]));
        let s = scheduler(1, transport.clone());
        let recorder = EventRecorder::attach(
            s.events(),
            &[
                names::REQUEST_START,
                names::REQUEST_ERROR_IGNORED,
                names::REQUEST_DATA,
                names::REQUEST_COMPLETE,
                names::ERROR,
            ],
        );

        let collected = s
            .drain(Request::get("http://svc/flaky").with_retry_budget(3))
            .await
            .unwrap();

        assert_eq!(collected.into_single(), Some(json!({"ok": true})));
        assert_eq!(
            recorder.names(),
            vec![
                "request_start",
                "request_error_ignored",
                "request_error_ignored",
                "request_data",
                "request_complete",
            ]
        );
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failure_does_not_stall_other_requests() {
        let transport = Arc::new(MockTransport::new(|options, _| {
            let delay = Duration::from_millis(fastrand::u64(1..=5));
            if options.url.path().ends_with('0') {
                MockReply::delayed(delay, MockReply::status(500))
            } else {
                MockReply::delayed(delay, MockReply::json(json!(1)))
            }
        }));
        let s = scheduler(2, transport.clone());

        let batch = s.run(requests(10), false).await.unwrap();

        let failed: Vec<RequestId> = batch
            .handles()
            .iter()
            .filter(|h| h.error().is_some())
            .map(|h| h.id())
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(transport.calls(), 10);
    }

    // ==========================================================================
    // Streams
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stream_is_union_of_all_values() {
        let s = scheduler(3, jittery(6));

        let mut results = s.stream(requests(12)).unwrap();
        let mut seen = HashSet::new();
        while let Some(value) = results.next().await {
            let value = value.unwrap();
            assert!(seen.insert(value.as_str().unwrap().to_string()));
        }

        let expected: HashSet<String> = (0..12).map(|i| format!("/item/{i}")).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_stream_of_silent_requests_terminates() {
        let transport = Arc::new(MockTransport::always(MockReply::status(410)));
        let s = scheduler(2, transport);

        let batch: Vec<Request> = requests(3)
            .into_iter()
            .map(|r| r.ignore_status([410]))
            .collect();
        let values = tokio::time::timeout(Duration::from_secs(5), s.collect(batch))
            .await
            .expect("stream did not terminate")
            .unwrap();
        assert!(values.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_queue_many_consumers_under_jitter() {
        let queue = AsyncQueue::new();
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let mut stream = queue.subscribe();
                tokio::spawn(async move {
                    let mut items = Vec::new();
                    while let Some(item) = stream.next().await {
                        items.push(item.unwrap());
                        if fastrand::bool() {
                            tokio::time::sleep(Duration::from_millis(1)).await;
                        }
                    }
                    items
                })
            })
            .collect();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                for i in 0..50 {
                    queue.enqueue(i);
                    if fastrand::u8(..) % 4 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                queue.stop();
            })
        };
        producer.await.unwrap();

        let expected: Vec<i32> = (0..50).collect();
        for consumer in consumers {
            assert_eq!(consumer.await.unwrap(), expected);
        }
    }

    // ==========================================================================
    // Emitter
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_emit_and_subscribe() {
        let source: EventEmitter<RestEvent> = EventEmitter::new();
        let sink: EventEmitter<RestEvent> = EventEmitter::new();
        source.pipe(&sink);

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            sink.on(names::REQUEST_START, move |event| {
                if let Some(id) = event.request_id() {
                    seen.lock().unwrap().push(id);
                }
            });
        }

        let emitters: Vec<_> = (0..4u64)
            .map(|t| {
                let source = source.clone();
                tokio::spawn(async move {
                    for i in 0..25u64 {
                        let id = RequestId::from_raw(t * 100 + i);
                        source.emit(&RestEvent::Start { id }).unwrap();
                        let listener = source.on(names::REQUEST_COMPLETE, |_| {});
                        source.off(names::REQUEST_COMPLETE, listener);
                    }
                })
            })
            .collect();
        for task in emitters {
            task.await.unwrap();
        }

        assert_eq!(seen.lock().unwrap().len(), 100);
        assert_eq!(source.listener_count(names::REQUEST_COMPLETE), 0);
    }
}
