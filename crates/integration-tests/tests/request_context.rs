//! Request context transactions and cache busting over SQLite

mod common;

use common::{Harness, NOW};
use tokio_test::{assert_err, assert_ok};

use taskbed_core::domain::{Affinity, Id, Job};
use taskbed_core::port::TxMode;
use taskbed_core::AppError;

fn job(h: &Harness, kind: &str) -> Job {
    Job::new(h.ids.next_at(NOW), kind, "", "{}", NOW)
}

async fn exists(h: &Harness, id: Id) -> bool {
    let mut rc = h.rc("lookup");
    rc.in_tx(Affinity::SafeReader, move |rc| {
        Box::pin(async move { rc.tx()?.job_exists(id).await })
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_staged_busts_flush_once_on_commit() {
    let h = Harness::new().await;
    let row = job(&h, "mail");
    let id = row.id;
    let mut rc = h.rc("write");

    assert_ok!(
        rc.in_tx(Affinity::SafeWriter, move |rc| {
            Box::pin(async move {
                rc.bust_cache(["user:1", "inbox:1"]);
                rc.tx()?.put_job(&row).await?;
                rc.bust_cache(["user:1"]);
                assert_eq!(rc.staged_busts().count(), 2);
                Ok::<(), AppError>(())
            })
        })
        .await
    );

    assert!(exists(&h, id).await);
    assert_eq!(
        h.cache.batches(),
        vec![vec!["inbox:1".to_string(), "user:1".to_string()]]
    );
    assert_eq!(rc.staged_busts().count(), 0);
}

#[tokio::test]
async fn test_rollback_discards_rows_but_still_busts() {
    let h = Harness::new().await;
    let row = job(&h, "mail");
    let id = row.id;
    let mut rc = h.rc("write");

    let err = assert_err!(
        rc.in_tx(Affinity::SafeWriter, move |rc| {
            Box::pin(async move {
                rc.tx()?.put_job(&row).await?;
                rc.bust_cache(["user:1"]);
                Err::<(), _>(AppError::handler("validation failed late"))
            })
        })
        .await
    );
    assert!(matches!(err, AppError::Handler(_)));

    assert!(!exists(&h, id).await);
    assert_eq!(h.cache.batches(), vec![vec!["user:1".to_string()]]);
}

#[tokio::test]
async fn test_bust_outside_writer_is_immediate() {
    let h = Harness::new().await;
    let mut rc = h.rc("read");

    rc.bust_cache(["a"]);
    let scope = rc.enter_tx(Affinity::SafeReader).await.unwrap();
    rc.bust_cache(["b"]);
    rc.exit_tx(scope, Ok(())).await.unwrap();

    assert_eq!(
        h.cache.batches(),
        vec![vec!["a".to_string()], vec!["b".to_string()]]
    );
}

#[tokio::test]
async fn test_writer_inside_reader_reopens_reader() {
    let h = Harness::new().await;
    let row = job(&h, "mail");
    let id = row.id;
    let mut rc = h.rc("mixed");

    let scope = rc.enter_tx(Affinity::SafeReader).await.unwrap();
    assert_eq!(rc.tx_mode(), Some(TxMode::Read));
    assert!(!rc.tx().unwrap().job_exists(id).await.unwrap());

    rc.in_tx(Affinity::SafeWriter, move |rc| {
        Box::pin(async move { rc.tx()?.put_job(&row).await })
    })
    .await
    .unwrap();

    // Back in a fresh reader that sees the write
    assert_eq!(rc.tx_mode(), Some(TxMode::Read));
    assert!(rc.tx().unwrap().job_exists(id).await.unwrap());

    rc.done_reading().await.unwrap();
    assert_eq!(rc.tx_mode(), None);
    rc.exit_tx(scope, Ok(())).await.unwrap();
    assert_eq!(rc.tx_mode(), None);
}

#[tokio::test]
async fn test_nested_scopes_reuse_the_writer() {
    let h = Harness::new().await;
    let first = job(&h, "mail");
    let second = job(&h, "mail");
    let (a, b) = (first.id, second.id);
    let mut rc = h.rc("nested");

    let err = assert_err!(
        rc.in_tx(Affinity::SafeWriter, move |rc| {
            Box::pin(async move {
                rc.tx()?.put_job(&first).await?;

                // A reader scope inside a writer shares it
                rc.in_tx(Affinity::SafeReader, move |rc| {
                    Box::pin(async move { rc.tx()?.put_job(&second).await })
                })
                .await?;
                assert_eq!(rc.tx_mode(), Some(TxMode::Write));

                let denied = rc.enter_tx(Affinity::ExclusiveWriter).await;
                assert!(matches!(denied, Err(AppError::InvalidState(_))));

                let denied = rc.done_reading().await;
                assert!(matches!(denied, Err(AppError::InvalidState(_))));

                Err::<(), _>(AppError::handler("abort"))
            })
        })
        .await
    );
    assert!(matches!(err, AppError::Handler(_)));

    // The outer rollback covers the inner scope's write too
    assert!(!exists(&h, a).await);
    assert!(!exists(&h, b).await);
}

#[tokio::test]
async fn test_cancelled_context_opens_no_transaction() {
    let h = Harness::new().await;
    let (shutdown_tx, token) = taskbed_core::application::shutdown_channel();
    let mut rc = h.rc("cancel").with_cancel(token);
    shutdown_tx.shutdown();

    let err = assert_err!(rc.enter_tx(Affinity::SafeWriter).await);
    assert!(matches!(err, AppError::Cancelled));

    // Scopes that touch no database still run
    let scope = assert_ok!(rc.enter_tx(Affinity::DbUnused).await);
    assert!(!scope.opened());
    assert_ok!(rc.exit_tx(scope, Ok(())).await);
}
