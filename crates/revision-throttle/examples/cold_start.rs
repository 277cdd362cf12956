use futures::future::BoxFuture;
use revision_throttle::{BreakerParams, LookupError, Revision, RevisionID, Throttle, ThrottleConfig};
use std::time::Duration;

#[tokio::main]
async fn main() {
    println!("Cold Start Example\n");

    // A fresh revision has no endpoints yet, so it starts at capacity 0.
    let params = BreakerParams::builder()
        .queue_depth(10)
        .max_concurrency(100)
        .initial_capacity(0)
        .build();

    let get_endpoints = |_rev_id: &RevisionID| -> BoxFuture<'_, Result<u32, LookupError>> {
        Box::pin(async { Ok(0) })
    };
    let get_revision = |_rev_id: &RevisionID| -> BoxFuture<'_, Result<Revision, LookupError>> {
        Box::pin(async { Ok(Revision::new(1)) })
    };

    let throttle = std::sync::Arc::new(Throttle::new(
        ThrottleConfig::builder(params, get_endpoints, get_revision)
            .on_capacity_changed(|revision, previous, current| {
                println!("{revision} capacity {previous} -> {current}");
            })
            .build(),
    ));

    let rev_id = RevisionID::new("default", "hello-00001");

    // This call queues, since capacity is still 0.
    let blocked = {
        let throttle = throttle.clone();
        let rev_id = rev_id.clone();
        tokio::spawn(async move {
            throttle
                .try_call(&rev_id, || async {
                    println!("request admitted and forwarded");
                })
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;

    // The endpoints informer reports the first ready pod.
    throttle.update_capacity(&rev_id, 1).await.unwrap();

    blocked.await.unwrap().unwrap();
    println!("\nRequest completed after endpoints became ready!");
}
