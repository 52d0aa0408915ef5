use bytes::Bytes;
use preview2_shim::future::future_pair;
use preview2_shim::runtime::spawn_blocking;
use preview2_shim::stream::{StreamError, stream_pair_with_capacity};

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn blocking_writers_feed_async_readers() -> anyhow::Result<()> {
    let (mut tx, mut rx) = stream_pair_with_capacity(1);
    let producer = spawn_blocking(move || {
        for i in 0..50u32 {
            tx.blocking_write(i)?;
        }
        Ok::<_, StreamError>(())
    });
    for i in 0..50u32 {
        assert_eq!(rx.read().await?, Some(i));
    }
    producer.await?;
    for _ in 0..3 {
        assert_eq!(rx.read().await?, None);
    }
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn futures_settle_across_threads() {
    let (tx, mut rx) = future_pair::<&str, ()>();
    std::thread::spawn(move || tx.resolve("done"));
    assert_eq!(rx.read().await, Ok(Some("done")));
    assert_eq!(rx.read().await, Ok(None));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn aborts_carry_typed_errors() {
    let (mut tx, mut rx) = stream_pair_with_capacity::<Bytes>(4);
    tx.write(Bytes::from_static(b"partial")).await.unwrap();
    tx.abort(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
    assert_eq!(rx.read().await.unwrap(), Some(Bytes::from_static(b"partial")));
    let err = rx.read().await.unwrap_err();
    let io = err.downcast_ref::<std::io::Error>().unwrap();
    assert_eq!(io.kind(), std::io::ErrorKind::UnexpectedEof);
    assert!(rx.is_ended());
}
