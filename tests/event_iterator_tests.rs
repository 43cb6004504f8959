use futures_util::StreamExt;
use rs2_flow::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::sleep;

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_items_pushed_before_first_pull_are_delivered_in_order() {
    let iter = EventIterator::<i32, &'static str>::new(|em| async move {
        em.push(1);
        em.push(2);
        em.push(3);
        em.stop("done");
        Ok(())
    });

    let (items, result) = iter.into_result().await.unwrap();
    assert_eq!(items, vec![1, 2, 3]);
    assert_eq!(result, Some("done"));
}

#[tokio::test]
async fn test_push_after_stop_is_rejected() {
    let (tx, rx) = oneshot::channel();
    let iter = EventIterator::<i32>::new(|em| async move {
        assert!(em.push(1));
        em.stop(());
        let _ = tx.send((em.push(2), em.is_stopped()));
        Ok(())
    });

    let (items, result) = iter.into_result().await.unwrap();
    assert_eq!(items, vec![1]);
    assert_eq!(result, Some(()));
    assert_eq!(rx.await.unwrap(), (false, true));
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let iter = EventIterator::<i32, u32>::new(|em| async move {
        em.push(1);
        em.stop(7);
        em.stop(8);
        Ok(())
    });

    let (items, result) = iter.into_result().await.unwrap();
    assert_eq!(items, vec![1]);
    assert_eq!(result, Some(7));
}

#[tokio::test]
async fn test_producer_pushing_over_time() {
    let mut iter = EventIterator::<u64>::new(|em| async move {
        for v in 0..5 {
            sleep(Duration::from_millis(5)).await;
            em.push(v);
        }
        em.stop(());
        Ok(())
    });

    let mut seen = Vec::new();
    while let Some(item) = iter.next().await {
        seen.push(item.unwrap());
    }
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_callback_returning_without_stop_keeps_sequence_open() {
    let iter = EventIterator::<u32>::new(|em| async move {
        // Hand the emitter to a background task and return immediately
        tokio::spawn(async move {
            for v in 0..3 {
                sleep(Duration::from_millis(10)).await;
                em.push(v);
            }
            em.stop(());
        });
        Ok(())
    });

    let (items, _) = iter.into_result().await.unwrap();
    assert_eq!(items, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_callback_runs_to_completion_after_normal_end() {
    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);

    let iter = EventIterator::<i32>::new(move |em| async move {
        em.push(1);
        em.stop(());
        // Cleanup after stop must not be cut short by the drained consumer
        sleep(Duration::from_millis(10)).await;
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });

    let (items, _) = iter.into_result().await.unwrap();
    assert_eq!(items, vec![1]);

    sleep(Duration::from_millis(100)).await;
    assert!(finished.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_event_stream_callback_finishes_after_drain() {
    let cleanups = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&cleanups);

    let s = event_stream(move |em: EventEmitter<u8>| {
        let counter = Arc::clone(&counter);
        async move {
            em.push(7);
            em.stop(());
            sleep(Duration::from_millis(10)).await;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    assert_eq!(s.collect().await, Ok(vec![7]));
    assert_eq!(s.collect().await, Ok(vec![7]));

    sleep(Duration::from_millis(100)).await;
    assert_eq!(cleanups.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_take_result_only_after_end() {
    let mut iter = EventIterator::<i32, String>::new(|em| async move {
        em.push(1);
        em.push(2);
        em.stop("finished".to_string());
        Ok(())
    });

    assert_eq!(iter.next().await, Some(Ok(1)));
    assert_eq!(iter.take_result(), None);
    assert_eq!(iter.next().await, Some(Ok(2)));
    assert_eq!(iter.next().await, None);
    assert_eq!(iter.take_result(), Some("finished".to_string()));
    assert_eq!(iter.take_result(), None);
}

#[tokio::test]
async fn test_producer_failure_fails_fast_by_default() {
    let items: Vec<_> = EventIterator::<i32>::new(|em| async move {
        em.push(1);
        Err(StreamError::producer("boom"))
    })
    .collect()
    .await;

    assert_eq!(items, vec![Ok(1), Err(StreamError::Producer("boom".into()))]);
}

#[tokio::test]
async fn test_producer_failure_before_any_push() {
    let result = EventIterator::<i32>::new(|_em| async move { Err(StreamError::producer("nothing to do")) })
        .into_result()
        .await;

    assert_eq!(result, Err(StreamError::Producer("nothing to do".into())));
}

#[tokio::test]
async fn test_producer_failure_log_and_continue() {
    let config = ProducerConfig::new().error_policy(ProducerErrorPolicy::LogAndContinue);
    let iter = EventIterator::<i32>::with_config(config, CancelToken::new(), |em| async move {
        em.push(1);
        Err(StreamError::producer("boom"))
    });

    let (items, result) = iter.into_result().await.unwrap();
    assert_eq!(items, vec![1]);
    assert_eq!(result, None);
}

#[tokio::test]
async fn test_panicking_producer_becomes_producer_error() {
    let items: Vec<_> = EventIterator::<i32>::new(|em| async move {
        em.push(1);
        if em.push(2) {
            panic!("exploded");
        }
        Ok(())
    })
    .collect()
    .await;

    assert_eq!(items.len(), 3);
    assert_eq!(items[0], Ok(1));
    assert_eq!(items[1], Ok(2));
    match &items[2] {
        Err(StreamError::Producer(msg)) => assert!(msg.contains("exploded"), "{}", msg),
        other => panic!("unexpected item: {:?}", other),
    }
}

#[tokio::test]
async fn test_dropping_consumer_cancels_producer() {
    let released = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&released);

    let mut iter = EventIterator::<u64>::new(move |em| async move {
        let _guard = DropFlag(flag);
        let mut v = 0;
        while em.push(v) {
            v += 1;
            sleep(Duration::from_millis(1)).await;
        }
        Ok(())
    });

    for expected in 0..3 {
        assert_eq!(iter.next().await, Some(Ok(expected)));
    }
    drop(iter);

    sleep(Duration::from_millis(50)).await;
    assert!(released.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_emitter_observes_close() {
    let (tx, rx) = oneshot::channel();
    let mut iter = EventIterator::<i32>::new(|em| async move {
        em.push(1);
        let watcher = em.clone();
        tokio::spawn(async move {
            watcher.cancelled().await;
            let _ = tx.send((watcher.is_cancelled(), watcher.push(2)));
        });
        Ok(())
    });

    assert_eq!(iter.next().await, Some(Ok(1)));
    iter.close();
    assert_eq!(iter.next().await, None);

    let (cancelled, accepted) = tokio::time::timeout(Duration::from_secs(1), rx)
        .await
        .unwrap()
        .unwrap();
    assert!(cancelled);
    assert!(!accepted);
}

#[tokio::test]
async fn test_event_stream_is_multi_consumable() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);

    let s = event_stream(move |em: EventEmitter<u32>| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            for v in 0..4 {
                sleep(Duration::from_millis(2)).await;
                em.push(v * v);
            }
            em.stop(());
            Ok(())
        }
    });

    assert!(s.is_reusable());
    assert_eq!(s.collect().await, Ok(vec![0, 1, 4, 9]));
    assert_eq!(s.collect().await, Ok(vec![0, 1, 4, 9]));
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_event_stream_composes_with_operators() {
    let s = event_stream(|em: EventEmitter<i32>| async move {
        for v in 1..=6 {
            em.push(v);
        }
        em.stop(());
        Ok(())
    });

    let result = s
        .filter(|v| futures_util::future::ready(v % 2 == 0))
        .parallel_map(2, |v| async move { v * 100 })
        .await;
    assert_eq!(result, Ok(vec![200, 400, 600]));
}

#[tokio::test]
async fn test_event_stream_with_config_applies_policy() {
    let config = ProducerConfig::new().error_policy(ProducerErrorPolicy::LogAndContinue);
    let s = event_stream_with_config(config, |em: EventEmitter<i32>| async move {
        em.push(10);
        em.push(20);
        Err(StreamError::producer("lost connection"))
    });

    assert_eq!(s.collect().await, Ok(vec![10, 20]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pushers() {
    let iter = EventIterator::<usize>::new(|em| async move {
        let mut handles = Vec::new();
        for worker in 0..4 {
            let em = em.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    em.push(worker * 100 + i);
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.map_err(StreamError::producer)?;
        }
        em.stop(());
        Ok(())
    });

    let (mut items, _) = iter.into_result().await.unwrap();
    assert_eq!(items.len(), 100);

    // Each pusher's items keep their relative order
    for worker in 0..4 {
        let mine: Vec<_> = items.iter().copied().filter(|v| v / 100 == worker).collect();
        assert_eq!(mine, (0..25).map(|i| worker * 100 + i).collect::<Vec<_>>());
    }
    items.sort_unstable();
    items.dedup();
    assert_eq!(items.len(), 100);
}
