use dataflow_pipeline::{
    Block, Builder, Envelope, ErrorCategory, MessageId, OfferStatus, PipelineError, SinkBlock,
    StageOptions, Target,
};
use std::sync::Arc;
use tokio_test::{assert_pending, assert_ready};

#[tokio::test]
async fn test_fault_at_root_reaches_terminal_stage() {
    for depth in [1usize, 3, 6] {
        let mut chain = Builder::new().create_buffer::<u32>();
        for _ in 0..depth {
            chain = chain.select(|x| x + 1);
        }
        let handle = chain.end();

        handle.send(1).await.unwrap();
        assert_eq!(handle.receive().await, Some(1 + depth as u32));

        handle.fault(PipelineError::faulted("root broke"));
        let err = handle.completion().await.unwrap_err();
        assert!(err.to_string().contains("root broke"), "depth {}: {}", depth, err);
        assert_eq!(err.category(), ErrorCategory::Propagated);
    }
}

#[tokio::test]
async fn test_normal_drain_completes_successfully() {
    let options = StageOptions::default().bounded(2);
    let handle = Builder::new()
        .create(Arc::new(Block::<u32, u32>::buffer(options.clone())))
        .then(Arc::new(Block::transform(|x: u32| x * 2, options.clone())))
        .then(Arc::new(Block::transform(|x: u32| x + 1, options)))
        .end();

    let sender = handle.clone();
    let producer = tokio::spawn(async move {
        for x in 0..100u32 {
            sender.send(x).await.unwrap();
        }
        sender.complete();
    });

    let outputs = handle.receive_all().await.unwrap();
    producer.await.unwrap();

    assert_eq!(outputs, (0..100u32).map(|x| x * 2 + 1).collect::<Vec<_>>());
    assert!(handle.completion().is_completed());
    // 完成結果可重複取得
    handle.completion().await.unwrap();
}

#[tokio::test]
async fn test_processing_error_names_failing_stage() {
    let result = Builder::new()
        .from_iter(["1", "2", "x", "4"])
        .then(Arc::new(Block::transform_async(
            |raw: &'static str| async move { raw.parse::<u32>() },
            StageOptions::named("parse"),
        )))
        .select(|n| n * 10)
        .end()
        .receive_all()
        .await;

    match result {
        Err(PipelineError::ProcessingError { stage, message }) => {
            assert_eq!(stage, "parse");
            assert!(message.contains("invalid digit"));
        }
        other => panic!("expected a processing error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_send_after_complete_is_rejected() {
    let handle = Builder::new().create_buffer::<u32>().select(|x| x).end();
    handle.complete();

    let err = handle.send(1).await.unwrap_err();
    assert!(matches!(err, PipelineError::SendAfterCompletion { .. }));
    assert!(err.is_programmer_error());
    handle.completion().await.unwrap();
}

#[tokio::test]
async fn test_sink_failure_fails_terminal_handle() {
    let terminal = Builder::new().from_iter(0..5u32).then_sink(Arc::new(
        SinkBlock::action_async(
            |x: u32| async move {
                if x == 3 {
                    Err("sink rejected 3")
                } else {
                    Ok(())
                }
            },
            StageOptions::named("writer"),
        ),
    ));

    let err = terminal.completion().await.unwrap_err();
    assert!(matches!(err, PipelineError::ProcessingError { ref stage, .. } if stage == "writer"));
}

#[tokio::test]
async fn test_panicking_stage_is_aborted() {
    let result = Builder::new()
        .from_iter(0..4u32)
        .select(|x| if x == 2 { panic!("bad input {}", x) } else { x })
        .end()
        .receive_all()
        .await;

    match result {
        Err(err @ PipelineError::StageAborted { .. }) => {
            assert!(err.is_programmer_error());
        }
        other => panic!("expected StageAborted, got {:?}", other),
    }
}

#[tokio::test]
async fn test_bounded_stage_applies_backpressure() {
    let block = Block::<u32, u32>::buffer(StageOptions::named("narrow").bounded(1));

    // worker 尚未執行，輸入佇列只容得下一則
    block.send(0).await.unwrap();
    match block.try_offer(Envelope::new(MessageId(99), 99)) {
        OfferStatus::Postponed(message) => assert_eq!(message.id(), MessageId(99)),
        other => panic!("expected the offer to be postponed, got {:?}", other),
    }

    let mut blocked = tokio_test::task::spawn(block.send(1));
    assert_pending!(blocked.poll());

    // 讓 worker 取走第一則後，等待中的送出即可完成
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
    assert!(blocked.is_woken());
    assert_ready!(blocked.poll()).unwrap();
    drop(blocked);

    block.complete();
    let mut seen = Vec::new();
    while let Some(message) = dataflow_pipeline::Source::receive(&block).await {
        seen.push(message.into_payload());
    }
    assert_eq!(seen, vec![0, 1]);
}
