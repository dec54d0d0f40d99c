//! End-to-end scenarios through the public API.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use relaykit::{
    CancellationToken, CompletionHandle, Error, Feedback, ListenerPool, Outcome, PipelineBuilder,
    ProcessStateToken, Pusher,
};

const PATTERN: [u64; 5] = [11, 3, 7, 55, 55];

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_sums_expanded_pattern() {
    let items: Vec<u64> = (0..40).map(|i| PATTERN[i % PATTERN.len()]).collect();
    let expected: u64 = items.iter().sum();
    assert_eq!(expected, 8 * 131);

    let total = Arc::new(AtomicU64::new(0));
    let pool = {
        let total = Arc::clone(&total);
        ListenerPool::from_async_fn(4, move |item: u64, _state: ProcessStateToken| {
            let total = Arc::clone(&total);
            async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                total.fetch_add(item, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap()
    };

    for item in items {
        pool.post(item).unwrap();
    }

    let token = CancellationToken::new();
    assert!(pool.when_free(&token).await);
    // Drained queues can still have handlers in flight.
    assert!(pool.when_idle(&token).await);

    assert_eq!(total.load(Ordering::SeqCst), expected);
    assert_eq!(pool.load().processed, 40);

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn feedback_delivers_delayed_values_in_order() {
    let mut feedback = Feedback::new(|pusher: Pusher<i32>| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        for value in [11, 12, 9] {
            assert!(pusher.push(value).await);
        }
        Ok::<_, Error>(())
    });

    assert_eq!(feedback.next().await, Ok(Some(11)));
    assert_eq!(feedback.next().await, Ok(Some(12)));
    assert_eq!(feedback.next().await, Ok(Some(9)));

    assert_eq!(feedback.completion().await, Outcome::Succeeded);
    assert!(feedback.is_finished());
    assert_eq!(feedback.next().await, Ok(None));
}

#[tokio::test]
async fn completion_handle_gates_pipeline_run() {
    let token = CancellationToken::new();
    let pipeline = PipelineBuilder::<u32, u32>::new()
        .transform_async(|x| async move { x + 1 })
        .transform(|x| x * 2)
        .build();

    let upstream = CompletionHandle::spawn(|cancel| async move {
        cancel.cancelled().await;
        Ok::<_, Error>(())
    });
    upstream.link_with(&token);

    assert_eq!(pipeline.run_async(5, &token).await, Ok(12));

    token.cancel();
    assert_eq!(upstream.wait().await, Outcome::Cancelled);
    assert_eq!(pipeline.run_async(5, &token).await, Err(Error::Cancelled));
}
