//! Machine-checked runs of the conditioned-copy sequence against the local
//! file system store, which evaluates tag conditions the way a correct store
//! must. The real-provider behavior under reproduction is exercised
//! separately in `test_real_azure.rs`.

use conditional_copy_repro::{
    drain_to_vec, ConditionalWriteOutcome, DestinationState, DownloadError, OVERWRITE_LOCAL_ID,
    RACING_LOCAL_ID, SOURCE_CONTENT,
};

mod common;

use common::{ensure_logging_ready, local_fs_harness};

#[tokio::test]
async fn seeded_source_has_original_content_and_no_tags() -> anyhow::Result<()> {
    ensure_logging_ready();
    let (_tempdir, harness) = local_fs_harness()?;

    harness.reset().await?;
    harness.seed_source().await?;

    let download = harness.storage().download(harness.source()).await?;
    assert_eq!(drain_to_vec(download).await?, SOURCE_CONTENT);
    assert!(harness.storage().get_tags(harness.source()).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn racing_copy_on_absent_destination_applies() -> anyhow::Result<()> {
    ensure_logging_ready();
    let (_tempdir, harness) = local_fs_harness()?;

    harness.reset().await?;
    harness.seed_source().await?;
    assert_eq!(harness.destination_state().await?, DestinationState::Absent);

    let outcome = harness.racing_conditioned_copy(RACING_LOCAL_ID).await?;
    assert!(
        outcome.is_applied(),
        "a correct store must accept a conditioned insert on an absent destination, got {outcome:?}"
    );

    // Content and tag became visible together.
    let download = harness.storage().download(harness.destination()).await?;
    assert_eq!(drain_to_vec(download).await?, SOURCE_CONTENT);
    assert_eq!(
        harness.destination_state().await?,
        DestinationState::Tagged {
            local_id: RACING_LOCAL_ID.to_string()
        }
    );
    Ok(())
}

#[tokio::test]
async fn reset_is_idempotent() -> anyhow::Result<()> {
    ensure_logging_ready();
    let (_tempdir, harness) = local_fs_harness()?;

    harness.reset().await?;
    harness.reset().await?;

    harness.seed_source().await?;
    harness.reset().await?;
    harness.reset().await?;

    assert!(matches!(
        harness.storage().download(harness.source()).await,
        Err(DownloadError::NotFound)
    ));
    Ok(())
}

#[tokio::test]
async fn conditioned_overwrite_outcomes_are_deterministic() -> anyhow::Result<()> {
    ensure_logging_ready();
    let (_tempdir, harness) = local_fs_harness()?;

    harness.reset().await?;
    harness.seed_source().await?;
    harness
        .racing_conditioned_copy(RACING_LOCAL_ID)
        .await?
        .ensure_applied()?;

    // Recorded tag is 123, so 456 passes and moves the tag forward.
    let first = harness
        .conditioned_overwrite_with_buffering(OVERWRITE_LOCAL_ID)
        .await?;
    assert!(first.is_applied(), "123 < 456 must pass, got {first:?}");

    // Recorded tag is now 456; the same id is rejected, every time.
    for _ in 0..2 {
        let repeat = harness
            .conditioned_overwrite_with_buffering(OVERWRITE_LOCAL_ID)
            .await?;
        assert!(
            matches!(repeat, ConditionalWriteOutcome::ConditionNotMet(_)),
            "456 < 456 must be rejected, got {repeat:?}"
        );
    }

    assert_eq!(
        harness.destination_state().await?,
        DestinationState::Tagged {
            local_id: OVERWRITE_LOCAL_ID.to_string()
        }
    );
    Ok(())
}

#[tokio::test]
async fn force_overwrite_resolves_any_prior_state() -> anyhow::Result<()> {
    ensure_logging_ready();

    // From an absent destination, twice over: the overwrite is repeatable.
    let (_tempdir, harness) = local_fs_harness()?;
    harness.reset().await?;
    harness.seed_source().await?;
    harness.force_overwrite().await?;
    assert_eq!(harness.destination_state().await?, DestinationState::Untagged);
    harness.force_overwrite().await?;
    assert_eq!(harness.destination_state().await?, DestinationState::Untagged);

    // From a tagged destination.
    let (_tempdir, harness) = local_fs_harness()?;
    harness.reset().await?;
    harness.seed_source().await?;
    harness
        .racing_conditioned_copy(RACING_LOCAL_ID)
        .await?
        .ensure_applied()?;
    harness.force_overwrite().await?;
    assert_eq!(harness.destination_state().await?, DestinationState::Untagged);

    let download = harness.storage().download(harness.destination()).await?;
    assert_eq!(drain_to_vec(download).await?, SOURCE_CONTENT);
    Ok(())
}

#[tokio::test]
async fn full_sequence_ends_resolved() -> anyhow::Result<()> {
    ensure_logging_ready();
    let (_tempdir, harness) = local_fs_harness()?;

    let report = harness.run_full_sequence().await?;

    // Against the correct-store oracle both conditioned writes go through;
    // what matters for any store is that the sequence terminates with the
    // destination resolved.
    assert!(report.racing_copy.is_applied());
    assert!(report.buffered_overwrite.is_applied());
    assert_eq!(report.final_state, DestinationState::Untagged);

    let download = harness.storage().download(harness.destination()).await?;
    assert_eq!(drain_to_vec(download).await?, SOURCE_CONTENT);
    assert!(harness
        .storage()
        .get_tags(harness.destination())
        .await?
        .is_empty());
    Ok(())
}
