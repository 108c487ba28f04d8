use camera_recorder::bus::{FrameBus, OverflowPolicy};
use camera_recorder::frame::{Frame, PixelFormat, RasterImage};
use chrono::Utc;
use std::time::Duration;

fn frame(sequence: u64) -> Frame {
    let image = RasterImage::new(4, 4, PixelFormat::Gray8, vec![0u8; 16]).unwrap();
    Frame::new(sequence, Utc::now(), image)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_subscribers_see_increasing_sequences() {
    let bus = FrameBus::new(2);
    let slow = bus.subscribe("slow");
    let fast = bus.subscribe_with("fast", 1024, OverflowPolicy::Warn);

    let publisher = {
        let bus = bus.clone();
        std::thread::spawn(move || {
            for seq in 1..=500 {
                bus.publish(frame(seq));
                if seq == 250 {
                    // Republishing old sequences must never reach subscribers
                    bus.publish(frame(10));
                    bus.publish(frame(250));
                }
            }
            bus.close();
        })
    };

    let slow_task = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(frame) = slow.recv().await {
            seen.push(frame.sequence());
            tokio::time::sleep(Duration::from_micros(200)).await;
        }
        seen
    });
    let fast_task = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(frame) = fast.recv().await {
            seen.push(frame.sequence());
        }
        seen
    });

    publisher.join().unwrap();
    let slow_seen = slow_task.await.unwrap();
    let fast_seen = fast_task.await.unwrap();

    assert!(slow_seen.windows(2).all(|w| w[0] < w[1]));
    assert!(fast_seen.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(fast_seen, (1..=500).collect::<Vec<_>>());
    // The slow viewer drops frames but always ends on the newest one
    assert_eq!(slow_seen.last(), Some(&500));
    assert_eq!(bus.stats().rejected, 2);
}

#[tokio::test]
async fn test_late_subscriber_only_sees_later_frames() {
    let bus = FrameBus::new(4);
    bus.publish(frame(1));
    bus.publish(frame(2));

    let late = bus.subscribe("late");
    bus.publish(frame(3));
    bus.close();

    assert_eq!(late.recv().await.unwrap().sequence(), 3);
    assert!(late.recv().await.is_none());
}

#[tokio::test]
async fn test_subscribe_after_close_ends_immediately() {
    let bus = FrameBus::new(4);
    bus.close();
    let sub = bus.subscribe("viewer");
    assert!(sub.is_closed());
    assert!(sub.recv().await.is_none());
}

#[test]
fn test_stats_per_subscriber() {
    let bus = FrameBus::new(1);
    let a = bus.subscribe("a");
    let _b = bus.subscribe_with("b", 8, OverflowPolicy::Warn);
    for seq in 1..=3 {
        bus.publish(frame(seq));
    }
    a.try_recv();

    let stats = bus.stats();
    assert_eq!(stats.published, 3);
    assert_eq!(stats.subscribers.len(), 2);
    assert_eq!(stats.subscribers[0].name, "a");
    assert_eq!(stats.subscribers[0].dropped, 2);
    assert_eq!(stats.subscribers[0].delivered, 1);
    assert_eq!(stats.subscribers[1].queued, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_subscribe_racing_close_still_ends() {
    for _ in 0..200 {
        let bus = FrameBus::new(2);
        let closer = {
            let bus = bus.clone();
            std::thread::spawn(move || bus.close())
        };
        let subscription = bus.subscribe("racer");
        closer.join().unwrap();

        let ended = tokio::time::timeout(Duration::from_secs(1), subscription.recv()).await;
        assert!(matches!(ended, Ok(None)));
        assert!(subscription.is_closed());
    }
}
