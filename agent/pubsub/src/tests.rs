use super::*;
use tokio::{sync::mpsc, time};

const TIMEOUT: time::Duration = time::Duration::from_secs(1);

fn forward(tx: mpsc::UnboundedSender<u32>) -> impl Fn(u32) + Send + Sync + 'static {
    move |msg| {
        let _ = tx.send(msg);
    }
}

#[tokio::test]
async fn fans_out_to_every_subscriber() {
    let bus = PubSub::<u32>::new(Handle::current());
    let (tx0, mut rx0) = mpsc::unbounded_channel();
    let (tx1, mut rx1) = mpsc::unbounded_channel();
    bus.subscribe(Topic::Pods, forward(tx0));
    bus.subscribe(Topic::Pods, forward(tx1));
    assert_eq!(bus.subscriber_count(Topic::Pods), 2);

    bus.publish(Topic::Pods, 7);

    assert_eq!(time::timeout(TIMEOUT, rx0.recv()).await, Ok(Some(7)));
    assert_eq!(time::timeout(TIMEOUT, rx1.recv()).await, Ok(Some(7)));
}

#[tokio::test]
async fn topics_are_isolated() {
    let bus = PubSub::<u32>::new(Handle::current());
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe(Topic::Services, forward(tx));

    bus.publish(Topic::Nodes, 1);
    bus.publish(Topic::Services, 2);

    assert_eq!(time::timeout(TIMEOUT, rx.recv()).await, Ok(Some(2)));
}

#[tokio::test]
async fn publish_without_subscribers_is_a_noop() {
    let bus = PubSub::<u32>::new(Handle::current());
    bus.publish(Topic::ApiServer, 1);
    assert_eq!(bus.subscriber_count(Topic::ApiServer), 0);
}

#[tokio::test]
async fn late_subscriber_misses_earlier_messages() {
    let bus = PubSub::<u32>::new(Handle::current());
    bus.publish(Topic::Pods, 1);

    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe(Topic::Pods, forward(tx));
    bus.publish(Topic::Pods, 2);

    assert_eq!(time::timeout(TIMEOUT, rx.recv()).await, Ok(Some(2)));
    tokio::task::yield_now().await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let bus = PubSub::<u32>::new(Handle::current());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = bus.subscribe(Topic::Nodes, forward(tx));

    bus.unsubscribe(Topic::Nodes, &id).expect("unsubscribe must succeed");
    assert_eq!(bus.subscriber_count(Topic::Nodes), 0);

    // Unknown ids and topics are tolerated.
    bus.unsubscribe(Topic::Nodes, &id).expect("repeat unsubscribe must succeed");
    bus.unsubscribe(Topic::Namespaces, "missing")
        .expect("unknown topic must succeed");

    bus.publish(Topic::Nodes, 3);
    // The subscriber's sender was dropped along with the callback.
    assert_eq!(time::timeout(TIMEOUT, rx.recv()).await, Ok(None));
}

#[tokio::test]
async fn unsubscribe_rejects_empty_id() {
    let bus = PubSub::<u32>::new(Handle::current());
    assert!(matches!(
        bus.unsubscribe(Topic::Pods, ""),
        Err(Error::EmptySubscriptionId)
    ));
}

#[tokio::test]
async fn panicking_subscriber_does_not_affect_others() {
    let bus = PubSub::<u32>::new(Handle::current());
    bus.subscribe(Topic::Pods, |_| panic!("subscriber failed"));
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe(Topic::Pods, forward(tx));

    bus.publish(Topic::Pods, 5);
    assert_eq!(time::timeout(TIMEOUT, rx.recv()).await, Ok(Some(5)));
}
