use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use spanner_rs::proto::google::rpc;
use spanner_rs::proto::google::spanner::v1 as proto;
use spanner_rs::{
    BeginMode, ErrorKind, KeySet, Mutation, PartitionOptions, ReadContext, RequestOptions,
    SessionKind, SessionPool, Statement, TimestampBound, Type, Value,
};

mod common;

use common::*;

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

fn selector(
    selector: Option<&proto::TransactionSelector>,
) -> Option<&proto::transaction_selector::Selector> {
    selector.and_then(|s| s.selector.as_ref())
}

fn is_begin(s: Option<&proto::TransactionSelector>) -> bool {
    matches!(
        selector(s),
        Some(proto::transaction_selector::Selector::Begin(_))
    )
}

fn selected_id(s: Option<&proto::TransactionSelector>) -> Option<Vec<u8>> {
    match selector(s) {
        Some(proto::transaction_selector::Selector::Id(id)) => Some(id.clone()),
        _ => None,
    }
}

fn rpc_status(code: tonic::Code, message: &str) -> rpc::Status {
    rpc::Status {
        code: code as i32,
        message: message.to_string(),
        details: vec![],
    }
}

fn singer(id: i64, name: &str) -> Vec<Value> {
    vec![Value::Int64(id), Value::String(name.to_string())]
}

#[tokio::test]
async fn test_commit_mutations() {
    let mock = MockConnection::new();
    let client = client(&mock, pool_config(2));

    let result = client
        .read_write()
        .run(|tx| {
            Box::pin(async move {
                tx.insert("Singers", &["SingerId", "FirstName"], vec![singer(1, "Alice")]);
                Ok(())
            })
        })
        .await
        .unwrap();

    assert_eq!(result.attempts, 1);
    assert_eq!(result.retry_count(), 0);
    assert_eq!(
        result.commit_timestamp,
        Some(UNIX_EPOCH + Duration::from_secs(COMMIT_SECONDS as u64))
    );

    let state = mock.state();
    assert_eq!(state.commits.len(), 1);
    assert_eq!(state.commits[0].mutations.len(), 1);
    // nothing was read, so the transaction is begun explicitly before committing
    assert_eq!(state.begins.len(), 1);
    assert_eq!(
        state.commits[0].transaction,
        Some(proto::commit_request::Transaction::TransactionId(
            b"tx-1".to_vec()
        ))
    );
    assert!(state.rollbacks.is_empty());
}

#[tokio::test]
async fn test_nothing_to_commit() {
    let mock = MockConnection::new();
    let client = client(&mock, pool_config(2));

    let result = client
        .read_write()
        .run(|_| Box::pin(async move { Ok(42) }))
        .await
        .unwrap();

    assert_eq!(result.value, 42);
    assert_eq!(result.commit_timestamp, None);
    assert!(mock.state().commits.is_empty());
    assert!(mock.state().begins.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_aborted_commit_is_retried() {
    let mock = MockConnection::new();
    mock.state()
        .commit_responses
        .push_back(Err(status(tonic::Code::Aborted, "Transaction was aborted")));
    let client = client(&mock, pool_config(2));

    let result = client
        .read_write()
        .run(|tx| {
            Box::pin(async move {
                tx.insert("Singers", &["SingerId", "FirstName"], vec![singer(1, "Alice")]);
                Ok(())
            })
        })
        .await
        .unwrap();

    assert_eq!(result.attempts, 2);
    assert_eq!(result.retry_count(), 1);
    let state = mock.state();
    assert_eq!(state.commits.len(), 2);
    assert_eq!(state.commits[0].mutations, state.commits[1].mutations);
    // an aborted transaction is not rolled back
    assert!(state.rollbacks.is_empty());
}

#[tokio::test]
async fn test_failed_work_rolls_back() {
    let mock = MockConnection::new();
    let client = client(&mock, pool_config(2));

    let err = client
        .run_in_transaction(|tx| {
            Box::pin(async move {
                tx.execute_update("UPDATE Singers SET FirstName = 'Bob' WHERE TRUE", &[])
                    .await?;
                Err::<(), _>(spanner_rs::Error::Client("changed my mind".to_string()))
            })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, spanner_rs::Error::Client(_)));
    let state = mock.state();
    assert!(state.commits.is_empty());
    assert_eq!(state.rollbacks.len(), 1);
    assert_eq!(state.rollbacks[0].transaction_id, b"tx-1".to_vec());
}

#[tokio::test]
async fn test_statements_begin_inline_with_increasing_seqno() {
    let mock = MockConnection::new();
    let client = client(&mock, pool_config(2));

    let result = client
        .read_write()
        .run(|tx| {
            Box::pin(async move {
                assert_eq!(tx.begin_mode(), BeginMode::NotStarted);
                let mut total = 0;
                for id in 0..3 {
                    total += tx
                        .execute_update(
                            "UPDATE Singers SET FirstName = 'Bob' WHERE SingerId = @id",
                            &[("id", &id)],
                        )
                        .await?;
                }
                assert_eq!(tx.begin_mode(), BeginMode::Inline);
                Ok(total)
            })
        })
        .await
        .unwrap();

    assert_eq!(result.value, 3);
    let state = mock.state();
    let seqnos: Vec<i64> = state.execute_sql.iter().map(|r| r.seqno).collect();
    assert_eq!(seqnos, vec![0, 1, 2]);
    assert!(is_begin(state.execute_sql[0].transaction.as_ref()));
    for request in &state.execute_sql[1..] {
        assert_eq!(
            selected_id(request.transaction.as_ref()),
            Some(b"tx-1".to_vec())
        );
    }
    assert!(state.begins.is_empty());
    assert_eq!(state.commits.len(), 1);
    assert!(state.leader_calls > 0);
}

#[tokio::test]
async fn test_session_not_found_replaces_session() {
    let mock = MockConnection::new();
    mock.state().execute_sql_responses.push_back(Err(status(
        tonic::Code::NotFound,
        "Session not found: projects/test-project/instances/test-instance/databases/test-db/sessions/1",
    )));
    let client = client(&mock, pool_config(2));

    let result = client
        .read_write()
        .run(|tx| {
            Box::pin(async move {
                tx.execute_update("DELETE FROM Singers WHERE TRUE", &[])
                    .await
            })
        })
        .await
        .unwrap();
    settle().await;

    assert_eq!(result.attempts, 2);
    assert_eq!(result.value, 1);
    let state = mock.state();
    assert_eq!(state.created.len(), 2);
    assert_eq!(state.deleted, vec![state.created[0].clone()]);
    assert_eq!(state.commits.len(), 1);
    assert_eq!(state.commits[0].session, state.created[1]);
}

#[tokio::test]
async fn test_commit_carries_highest_precommit_token() {
    let mock = MockConnection::new();
    for seq_num in [2, 1] {
        mock.state().execute_sql_responses.push_back(Ok(proto::ResultSet {
            metadata: metadata(&Default::default()),
            stats: exact_count(1),
            precommit_token: Some(proto::MultiplexedSessionPrecommitToken {
                precommit_token: format!("token-{}", seq_num).into_bytes(),
                seq_num,
            }),
            ..Default::default()
        }));
    }
    let client = client(&mock, pool_config(2));

    client
        .run_in_transaction(|tx| {
            Box::pin(async move {
                tx.execute_update("UPDATE Singers SET FirstName = 'A' WHERE TRUE", &[])
                    .await?;
                tx.execute_update("UPDATE Singers SET LastName = 'B' WHERE TRUE", &[])
                    .await
            })
        })
        .await
        .unwrap();

    let state = mock.state();
    let token = state.commits[0].precommit_token.as_ref().unwrap();
    assert_eq!(token.seq_num, 2);
    assert_eq!(token.precommit_token, b"token-2".to_vec());
}

#[tokio::test]
async fn test_commit_retried_with_returned_precommit_token() {
    let mock = MockConnection::new();
    mock.state().commit_responses.push_back(Ok(proto::CommitResponse {
        multiplexed_session_retry: Some(
            proto::commit_response::MultiplexedSessionRetry::PrecommitToken(
                proto::MultiplexedSessionPrecommitToken {
                    precommit_token: b"retry".to_vec(),
                    seq_num: 5,
                },
            ),
        ),
        ..Default::default()
    }));
    let client = client(&mock, pool_config(2));

    let result = client
        .read_write()
        .run(|tx| {
            Box::pin(async move {
                tx.delete("Singers", KeySet::all());
                Ok(())
            })
        })
        .await
        .unwrap();

    assert_eq!(result.attempts, 1);
    assert!(result.commit_timestamp.is_some());
    let state = mock.state();
    assert_eq!(state.commits.len(), 2);
    assert_eq!(
        state.commits[1]
            .precommit_token
            .as_ref()
            .map(|token| token.seq_num),
        Some(5)
    );
}

#[tokio::test]
async fn test_batch_dml_reports_failed_statement() {
    let mock = MockConnection::new();
    mock.state()
        .batch_dml_responses
        .push_back(Ok(proto::ExecuteBatchDmlResponse {
            result_sets: vec![proto::ResultSet {
                stats: exact_count(1),
                ..Default::default()
            }],
            status: Some(rpc_status(tonic::Code::InvalidArgument, "Column not found")),
            precommit_token: None,
        }));
    let client = client(&mock, pool_config(2));

    let result = client
        .run_in_transaction(|tx| {
            Box::pin(async move {
                tx.execute_updates(&[
                    Statement::from("UPDATE Singers SET FirstName = 'A' WHERE TRUE"),
                    Statement::from("UPDATE Singers SET Nope = 'B' WHERE TRUE"),
                    Statement::from("UPDATE Singers SET LastName = 'C' WHERE TRUE"),
                ])
                .await
            })
        })
        .await
        .unwrap();

    assert_eq!(result.row_counts, vec![1]);
    let failure = result.failure.unwrap();
    assert_eq!(failure.index, 1);
    assert_eq!(failure.error.kind(), ErrorKind::InvalidArgument);
    assert_eq!(mock.state().batch_dml[0].seqno, 0);
}

#[tokio::test(start_paused = true)]
async fn test_aborted_batch_dml_retries_transaction() {
    let mock = MockConnection::new();
    mock.state()
        .batch_dml_responses
        .push_back(Ok(proto::ExecuteBatchDmlResponse {
            result_sets: vec![],
            status: Some(rpc_status(tonic::Code::Aborted, "Transaction was aborted")),
            precommit_token: None,
        }));
    let client = client(&mock, pool_config(2));

    let result = client
        .read_write()
        .run(|tx| {
            Box::pin(async move {
                tx.execute_updates(&[Statement::from("DELETE FROM Singers WHERE TRUE")])
                    .await?
                    .into_result()
            })
        })
        .await
        .unwrap();

    assert_eq!(result.attempts, 2);
    assert_eq!(result.value, vec![1]);
}

#[tokio::test]
async fn test_chunked_string_is_reassembled() {
    let mock = MockConnection::new();
    let row_type = single_column("val", Type::String);
    mock.state().stream_responses.push_back(vec![
        Ok(proto::PartialResultSet {
            metadata: metadata(&row_type),
            chunked_value: true,
            ..frame(&["Al"])
        }),
        Ok(proto::PartialResultSet {
            resume_token: b"t1".to_vec(),
            ..frame(&["ice"])
        }),
    ]);
    let client = client(&mock, pool_config(2));

    let mut stream = client
        .stream_query(
            Statement::from("SELECT val FROM t"),
            TimestampBound::Strong,
            RequestOptions::default(),
        )
        .await
        .unwrap();

    let row = stream.next().await.unwrap().unwrap();
    let val: &str = row.get("val").unwrap();
    assert_eq!(val, "Alice");
    assert_eq!(stream.resume_token(), b"t1");
    assert!(stream.next().await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_broken_stream_resumes_without_duplicates() {
    let mock = MockConnection::new();
    let row_type = single_column("v", Type::Int64);
    mock.state().stream_responses.push_back(vec![
        Ok(proto::PartialResultSet {
            metadata: metadata(&row_type),
            resume_token: b"t1".to_vec(),
            ..frame(&["0"])
        }),
        Ok(frame(&["1"])),
        Err(status(
            tonic::Code::Internal,
            "Received RST_STREAM with error code 2",
        )),
    ]);
    mock.state().stream_responses.push_back(vec![Ok(proto::PartialResultSet {
        resume_token: b"t2".to_vec(),
        ..frame(&["1", "2"])
    })]);
    let client = client(&mock, pool_config(2));

    let rows: Vec<i64> = client
        .stream_query(
            Statement::from("SELECT v FROM t"),
            TimestampBound::Strong,
            RequestOptions::default(),
        )
        .await
        .unwrap()
        .into_stream()
        .map(|row| row.and_then(|row| row.get::<i64, _>("v")))
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(rows, vec![0, 1, 2]);
    let state = mock.state();
    assert_eq!(state.streams.len(), 2);
    assert!(state.streams[0].resume_token().is_empty());
    assert_eq!(state.streams[1].resume_token(), b"t1");
}

#[tokio::test]
async fn test_non_resumable_stream_error_surfaces() {
    let mock = MockConnection::new();
    mock.state().stream_responses.push_back(vec![Err(status(
        tonic::Code::InvalidArgument,
        "Syntax error",
    ))]);
    let client = client(&mock, pool_config(2));

    let err = client
        .read_only()
        .await
        .unwrap()
        .execute_query("SELEC 1", &[])
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(mock.state().streams.len(), 1);
}

#[tokio::test]
async fn test_single_use_reads() {
    let mock = MockConnection::new();
    let client = client(&mock, pool_config(2));

    let mut tx = client.read_only().await.unwrap();
    assert!(!tx.is_multi_use());
    tx.execute_query("SELECT 1", &[]).await.unwrap();
    tx.read("Singers", KeySet::all(), &["SingerId"])
        .await
        .unwrap();

    let state = mock.state();
    assert_eq!(state.streams.len(), 2);
    for call in &state.streams {
        assert!(matches!(
            selector(call.transaction()),
            Some(proto::transaction_selector::Selector::SingleUse(_))
        ));
    }
    assert!(state.begins.is_empty());
}

#[tokio::test]
async fn test_snapshot_reads_share_transaction() {
    let mock = MockConnection::new();
    let client = client(&mock, pool_config(2));

    let mut snapshot = client
        .snapshot(TimestampBound::ExactStaleness(Duration::from_secs(10)))
        .await
        .unwrap();
    assert!(snapshot.is_multi_use());
    assert!(snapshot.read_timestamp().is_some());
    snapshot.execute_query("SELECT 1", &[]).await.unwrap();
    snapshot.execute_query("SELECT 2", &[]).await.unwrap();

    let state = mock.state();
    assert_eq!(state.begins.len(), 1);
    for call in &state.streams {
        assert_eq!(selected_id(call.transaction()), Some(b"tx-1".to_vec()));
    }
}

#[tokio::test]
async fn test_pool_waiters_are_served_in_order() {
    let mock = MockConnection::new();
    let pool = SessionPool::new(Box::new(mock.clone()), pool_config(2), None);

    let first = pool.acquire(SessionKind::ReadWrite).await.unwrap();
    let second = pool.acquire(SessionKind::ReadWrite).await.unwrap();
    let first_name = first.name().to_string();
    let second_name = second.name().to_string();

    let third = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(SessionKind::ReadWrite).await })
    };
    while pool.stats().waiters < 1 {
        tokio::task::yield_now().await;
    }
    let fourth = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(SessionKind::ReadWrite).await })
    };
    while pool.stats().waiters < 2 {
        tokio::task::yield_now().await;
    }

    drop(first);
    let third = third.await.unwrap().unwrap();
    assert_eq!(third.name(), first_name);

    drop(second);
    let fourth = fourth.await.unwrap().unwrap();
    assert_eq!(fourth.name(), second_name);

    assert_eq!(mock.state().created.len(), 2);
    assert_eq!(pool.stats().waiters, 0);
    assert_eq!(pool.stats().in_use, 2);
}

#[tokio::test(start_paused = true)]
async fn test_pool_acquire_times_out() {
    let mock = MockConnection::new();
    let pool = SessionPool::new(Box::new(mock.clone()), pool_config(1), None);

    let _held = pool.acquire(SessionKind::ReadWrite).await.unwrap();
    let err = pool
        .acquire_until(
            SessionKind::ReadWrite,
            tokio::time::Instant::now() + Duration::from_millis(100),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    assert_eq!(pool.stats().waiters, 0);
}

#[tokio::test]
async fn test_mutation_batch_commits_single_use() {
    let mock = MockConnection::new();
    let client = client(&mock, pool_config(2));

    let result = client
        .batch()
        .insert("Singers", &["SingerId", "FirstName"], vec![singer(1, "Alice")])
        .mutation(Mutation::delete("Albums", KeySet::all()))
        .commit()
        .await
        .unwrap();

    assert!(result.commit_timestamp.is_some());
    let state = mock.state();
    assert_eq!(state.commits.len(), 1);
    assert_eq!(state.commits[0].mutations.len(), 2);
    assert!(matches!(
        state.commits[0].transaction,
        Some(proto::commit_request::Transaction::SingleUseTransaction(_))
    ));
    assert!(state.begins.is_empty());
}

#[tokio::test]
async fn test_batch_write_results() {
    let mock = MockConnection::new();
    mock.state().batch_write_responses.push_back(vec![
        Ok(proto::BatchWriteResponse {
            indexes: vec![0],
            status: None,
            commit_timestamp: Some(prost_types::Timestamp {
                seconds: COMMIT_SECONDS,
                nanos: 0,
            }),
        }),
        Ok(proto::BatchWriteResponse {
            indexes: vec![1],
            status: Some(rpc_status(tonic::Code::FailedPrecondition, "Row exists")),
            commit_timestamp: None,
        }),
    ]);
    let client = client(&mock, pool_config(2));

    let results: Vec<_> = client
        .batch_write(vec![
            vec![Mutation::insert("Singers", &["SingerId", "FirstName"], vec![singer(1, "Alice")])],
            vec![Mutation::insert("Singers", &["SingerId", "FirstName"], vec![singer(2, "Bob")])],
        ])
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(results.len(), 2);
    let first = results[0].as_ref().unwrap();
    assert_eq!(first.indexes, vec![0]);
    assert!(matches!(first.status, Ok(Some(_))));
    let second = results[1].as_ref().unwrap();
    assert_eq!(second.indexes, vec![1]);
    assert_eq!(
        second.status.as_ref().unwrap_err().kind(),
        ErrorKind::FailedPrecondition
    );
    assert_eq!(mock.state().batch_writes[0].mutation_groups.len(), 2);
}

#[tokio::test]
async fn test_partitioned_query() {
    let mock = MockConnection::new();
    let row_type = single_column("v", Type::Int64);
    mock.state()
        .partition_responses
        .push_back(proto::PartitionResponse {
            partitions: vec![
                proto::Partition {
                    partition_token: b"p1".to_vec(),
                },
                proto::Partition {
                    partition_token: b"p2".to_vec(),
                },
            ],
            transaction: None,
        });
    for v in ["1", "2"] {
        mock.state().stream_responses.push_back(vec![Ok(proto::PartialResultSet {
            metadata: metadata(&row_type),
            resume_token: b"end".to_vec(),
            ..frame(&[v])
        })]);
    }
    let client = client(&mock, pool_config(2));

    let snapshot = client.batch_snapshot(TimestampBound::Strong).await.unwrap();
    let partitions = snapshot
        .partition_query(
            Statement::from("SELECT v FROM t"),
            PartitionOptions {
                max_partitions: Some(10),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(partitions.len(), 2);

    // partitions can be processed by another client attached to the same transaction
    let attached = client.attach_batch_snapshot(snapshot.id().clone());
    let mut values = Vec::new();
    for partition in &partitions {
        let result_set = attached.execute(partition).await.unwrap();
        for row in result_set.iter() {
            values.push(row.get::<i64, _>("v").unwrap());
        }
    }
    assert_eq!(values, vec![1, 2]);

    let state = mock.state();
    assert_eq!(state.begins.len(), 1);
    assert_eq!(
        state.partition_queries[0]
            .partition_options
            .as_ref()
            .map(|options| options.max_partitions),
        Some(10)
    );
    let tokens: Vec<&[u8]> = state
        .streams
        .iter()
        .map(|call| match call {
            StreamCall::Sql(request) => request.partition_token.as_slice(),
            StreamCall::Read(request) => request.partition_token.as_slice(),
        })
        .collect();
    assert_eq!(tokens, vec![b"p1".as_ref(), b"p2".as_ref()]);
    for call in &state.streams {
        assert_eq!(selected_id(call.transaction()), Some(b"tx-1".to_vec()));
    }
}

#[tokio::test]
async fn test_no_partitions() {
    let mock = MockConnection::new();
    let client = client(&mock, pool_config(2));

    let snapshot = client.batch_snapshot(TimestampBound::Strong).await.unwrap();
    let partitions = snapshot
        .partition_read(
            &spanner_rs::Read::new("Singers", &["SingerId"], KeySet::all()),
            PartitionOptions::default(),
        )
        .await
        .unwrap();

    assert!(partitions.is_empty());
    assert_eq!(mock.state().partition_reads.len(), 1);
}

#[tokio::test]
async fn test_partitioned_dml() {
    let mock = MockConnection::new();
    mock.state().stream_responses.push_back(vec![Ok(proto::PartialResultSet {
        metadata: metadata(&Default::default()),
        stats: Some(proto::ResultSetStats {
            query_stats: None,
            row_count: Some(proto::result_set_stats::RowCount::RowCountLowerBound(42)),
        }),
        ..Default::default()
    })]);
    let client = client(&mock, pool_config(2));

    let count = client
        .execute_partitioned_dml("DELETE FROM Singers WHERE SingerId > @id", &[("id", &10)])
        .await
        .unwrap();

    assert_eq!(count, 42);
    let state = mock.state();
    assert_eq!(state.begins.len(), 1);
    assert!(matches!(
        state.begins[0].options.as_ref().and_then(|o| o.mode.as_ref()),
        Some(proto::transaction_options::Mode::PartitionedDml(_))
    ));
    assert_eq!(
        selected_id(state.streams[0].transaction()),
        Some(b"tx-1".to_vec())
    );
}

#[tokio::test]
async fn test_list_sessions_follows_pages() {
    let mock = MockConnection::new();
    let client = client(&mock, pool_config(3));

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(client.snapshot(TimestampBound::Strong).await.unwrap());
    }

    let sessions = client.list_sessions().await.unwrap();
    let mut names: Vec<String> = sessions.iter().map(|s| s.name().to_string()).collect();
    names.sort();
    let mut created = mock.state().created.clone();
    created.sort();
    assert_eq!(names, created);
    assert_eq!(names.len(), 3);
}

#[tokio::test]
async fn test_close_deletes_idle_sessions() {
    let mock = MockConnection::new();
    let client = client(&mock, pool_config(2));

    client.read_only().await.unwrap();
    settle().await;
    client.close().await;

    let state = mock.state();
    assert_eq!(state.created.len(), 1);
    assert_eq!(state.deleted, state.created);
    drop(state);
    assert!(client.read_only().await.is_err());
}

#[test]
fn test_commit_timestamp_is_after_epoch() {
    assert!(UNIX_EPOCH + Duration::from_secs(COMMIT_SECONDS as u64) < SystemTime::now());
}
