use crate::downloader::test_helpers::{
    create_test_downloader, register_mock, request, wait_until, EventCollector, MockScript,
};
use crate::types::{ContentState, Event, Provider, StopRequest};
use std::collections::HashSet;
use std::time::{Duration, Instant};

fn cbz_files(root: &std::path::Path) -> Vec<String> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .map(|ext| ext == "cbz")
                .unwrap_or(false)
        })
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect()
}

// --- happy path ---

#[tokio::test]
async fn five_units_walk_the_full_lifecycle_and_archive() {
    let (downloader, temp_dir) = create_test_downloader().await;
    let repo = register_mock(
        &downloader,
        Provider::Mangadex,
        MockScript::with_units(5, 3),
    );
    let events = EventCollector::attach(&downloader);

    downloader
        .download(request(Provider::Mangadex, "abc"))
        .await
        .unwrap();

    wait_until("item to complete and be removed", || async {
        downloader.content("abc").await.is_none()
            && events
                .snapshot()
                .iter()
                .any(|e| matches!(e, Event::ContentRemoved { id } if id == "abc"))
    })
    .await;

    // Full state walk, in order
    let states = events.states_for("abc");
    let expected = [
        ContentState::Loading,
        ContentState::Ready,
        ContentState::Downloading,
        ContentState::Cleanup,
    ];
    let mut cursor = 0;
    for state in &states {
        if cursor < expected.len() && *state == expected[cursor] {
            cursor += 1;
        }
    }
    assert_eq!(
        cursor,
        expected.len(),
        "expected Loading→Ready→Downloading→Cleanup within {states:?}"
    );

    // Final progress hit exactly 100
    let max_progress = events
        .snapshot()
        .iter()
        .filter_map(|e| match e {
            Event::Progress { progress, .. } => Some(*progress),
            _ => None,
        })
        .fold(0.0_f64, f64::max);
    assert_eq!(max_progress, 100.0);

    // Finished notification with zero recorded failures
    let finished = events.snapshot().into_iter().find_map(|e| match e {
        Event::DownloadFinished {
            new_units, failed, ..
        } => Some((new_units, failed)),
        _ => None,
    });
    let (new_units, failed) = finished.expect("DownloadFinished must be emitted");
    assert_eq!(new_units.len(), 5);
    assert_eq!(failed, 0, "no retries were recorded");

    // Every sub-unit fetched exactly once
    assert_eq!(repo.fetches(), 15);

    // Output archived: one .cbz per unit, page dirs gone
    let archives = cbz_files(temp_dir.path());
    assert_eq!(archives.len(), 5, "one archive per unit, got: {archives:?}");
    let names: HashSet<_> = archives.into_iter().collect();
    for chapter in 1..=5 {
        assert!(
            names.contains(&format!("Series abc Ch. {chapter:04}.cbz")),
            "missing archive for chapter {chapter}"
        );
    }
}

// --- retry behavior ---

#[tokio::test]
async fn transient_failure_retries_once_and_still_completes() {
    let (downloader, _temp_dir) = create_test_downloader().await;
    let script = MockScript {
        fail_once: [(2, 2)].into_iter().collect(),
        ..MockScript::with_units(5, 3)
    };
    let repo = register_mock(&downloader, Provider::Mangadex, script);
    let events = EventCollector::attach(&downloader);

    downloader
        .download(request(Provider::Mangadex, "abc"))
        .await
        .unwrap();

    wait_until("item to complete", || async {
        events
            .snapshot()
            .iter()
            .any(|e| matches!(e, Event::DownloadFinished { .. }))
    })
    .await;

    let failed = events
        .snapshot()
        .into_iter()
        .find_map(|e| match e {
            Event::DownloadFinished { failed, .. } => Some(failed),
            _ => None,
        })
        .unwrap();
    assert_eq!(failed, 1, "exactly one soft failure must be recorded");

    // 15 pages + 1 retry
    assert_eq!(repo.fetches(), 16);

    // The item still reached Cleanup
    assert!(events
        .states_for("abc")
        .contains(&ContentState::Cleanup));
}

#[tokio::test]
async fn retry_failure_aborts_the_item_and_deletes_output() {
    let (downloader, temp_dir) = create_test_downloader().await;
    let script = MockScript {
        fail_always: [(2, 2)].into_iter().collect(),
        ..MockScript::with_units(5, 3)
    };
    register_mock(&downloader, Provider::Mangadex, script);
    let events = EventCollector::attach(&downloader);

    downloader
        .download(request(Provider::Mangadex, "abc"))
        .await
        .unwrap();

    wait_until("item to abort and be removed", || async {
        downloader.content("abc").await.is_none()
            && events
                .snapshot()
                .iter()
                .any(|e| matches!(e, Event::ContentRemoved { id } if id == "abc"))
    })
    .await;

    // A human-readable failure notification names the failing unit
    let failure = events.snapshot().into_iter().find_map(|e| match e {
        Event::DownloadFailed { error, .. } => Some(error),
        _ => None,
    });
    let failure = failure.expect("DownloadFailed must be emitted");
    assert!(
        failure.contains("Series abc"),
        "failure summary should mention the series, got: {failure}"
    );

    // No success notification, no further units attempted
    assert!(
        !events
            .snapshot()
            .iter()
            .any(|e| matches!(e, Event::DownloadFinished { .. })),
        "an aborted item must not report success"
    );

    // delete-files semantics: the series directory is gone
    assert!(
        !temp_dir.path().join("Manga").join("Series abc").exists(),
        "abort must delete this run's output"
    );
    assert!(cbz_files(temp_dir.path()).is_empty());
}

// --- cancellation ---

#[tokio::test]
async fn cancelling_mid_download_returns_within_the_bounded_window() {
    let (downloader, temp_dir) = create_test_downloader().await;
    let script = MockScript {
        // Second page of the first unit hangs forever
        stall: [(1, 2)].into_iter().collect(),
        ..MockScript::with_units(5, 3)
    };
    register_mock(&downloader, Provider::Mangadex, script);
    let events = EventCollector::attach(&downloader);

    downloader
        .download(request(Provider::Mangadex, "abc"))
        .await
        .unwrap();

    wait_until("item to start downloading", || async {
        downloader
            .content("abc")
            .await
            .map(|info| info.downloading)
            .unwrap_or(false)
    })
    .await;

    let start = Instant::now();
    downloader
        .remove_download(StopRequest {
            provider: Provider::Mangadex,
            id: "abc".to_string(),
            delete_files: true,
        })
        .await
        .unwrap();

    wait_until("cancelled item to finish cleanup", || async {
        events
            .snapshot()
            .iter()
            .any(|e| matches!(e, Event::ContentRemoved { id } if id == "abc"))
    })
    .await;

    // cancel_wait is 2s in the test config; well under the 10s poll deadline
    assert!(
        start.elapsed() < Duration::from_secs(8),
        "cancellation took {:?}, beyond the bounded window",
        start.elapsed()
    );

    // Cancellation is not a failure
    assert!(
        !events
            .snapshot()
            .iter()
            .any(|e| matches!(e, Event::DownloadFailed { .. })),
        "deliberate cancellation must never surface as a failure"
    );

    assert!(
        !temp_dir.path().join("Manga").join("Series abc").exists(),
        "cancel with delete_files must remove partial output"
    );
}

// --- waiting / authorization flow ---

#[tokio::test]
async fn not_start_immediately_parks_the_item_until_authorized() {
    let (downloader, temp_dir) = create_test_downloader().await;
    register_mock(
        &downloader,
        Provider::Mangadex,
        MockScript::with_units(3, 2),
    );
    let events = EventCollector::attach(&downloader);

    let mut req = request(Provider::Mangadex, "abc");
    req.start_immediately = false;
    downloader.download(req).await.unwrap();

    wait_until("item to park in Waiting", || async {
        downloader
            .content("abc")
            .await
            .map(|info| info.state == ContentState::Waiting)
            .unwrap_or(false)
    })
    .await;

    // Parked items stay parked
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        downloader.content("abc").await.unwrap().state,
        ContentState::Waiting
    );

    // Narrow the selection, then authorize
    downloader
        .set_selected_units("abc", vec!["abc-u1".to_string(), "abc-u3".to_string()])
        .await
        .unwrap();
    downloader.start_download("abc").await.unwrap();

    wait_until("authorized item to complete", || async {
        events
            .snapshot()
            .iter()
            .any(|e| matches!(e, Event::DownloadFinished { .. }))
    })
    .await;

    let archives = cbz_files(temp_dir.path());
    let names: HashSet<_> = archives.iter().cloned().collect();
    assert_eq!(archives.len(), 2, "only the selected units download");
    assert!(names.contains("Series abc Ch. 0001.cbz"));
    assert!(names.contains("Series abc Ch. 0003.cbz"));
}

// --- on-disk comparison ---

#[tokio::test]
async fn units_already_on_disk_are_not_downloaded_again() {
    let (downloader, temp_dir) = create_test_downloader().await;
    let repo = register_mock(
        &downloader,
        Provider::Mangadex,
        MockScript::with_units(3, 2),
    );
    let events = EventCollector::attach(&downloader);

    // Chapter 1 already archived from an earlier run
    let series_dir = temp_dir.path().join("Manga").join("Series abc");
    std::fs::create_dir_all(&series_dir).unwrap();
    std::fs::write(series_dir.join("Series abc Ch. 0001.cbz"), b"old archive").unwrap();

    downloader
        .download(request(Provider::Mangadex, "abc"))
        .await
        .unwrap();

    wait_until("item to complete", || async {
        events
            .snapshot()
            .iter()
            .any(|e| matches!(e, Event::DownloadFinished { .. }))
    })
    .await;

    let new_units = events
        .snapshot()
        .into_iter()
        .find_map(|e| match e {
            Event::DownloadFinished { new_units, .. } => Some(new_units),
            _ => None,
        })
        .unwrap();
    assert_eq!(new_units.len(), 2, "chapter 1 must be skipped");
    assert_eq!(repo.fetches(), 4, "only chapters 2 and 3 fetch pages");

    // The old archive is untouched
    let contents = std::fs::read(series_dir.join("Series abc Ch. 0001.cbz")).unwrap();
    assert_eq!(contents, b"old archive");
}

#[tokio::test]
async fn nothing_new_to_download_removes_the_item_quietly() {
    let (downloader, temp_dir) = create_test_downloader().await;
    register_mock(
        &downloader,
        Provider::Mangadex,
        MockScript::with_units(1, 2),
    );
    let events = EventCollector::attach(&downloader);

    let series_dir = temp_dir.path().join("Manga").join("Series abc");
    std::fs::create_dir_all(&series_dir).unwrap();
    std::fs::write(series_dir.join("Series abc Ch. 0001.cbz"), b"old").unwrap();

    downloader
        .download(request(Provider::Mangadex, "abc"))
        .await
        .unwrap();

    wait_until("item to be removed", || async {
        downloader.content("abc").await.is_none()
            && events
                .snapshot()
                .iter()
                .any(|e| matches!(e, Event::ContentRemoved { id } if id == "abc"))
    })
    .await;

    assert!(
        !events
            .snapshot()
            .iter()
            .any(|e| matches!(e, Event::DownloadFinished { .. })),
        "empty runs stay quiet unless log_empty_downloads is set"
    );
    assert!(
        !events
            .snapshot()
            .iter()
            .any(|e| matches!(e, Event::DownloadFailed { .. })),
        "nothing-to-do is not a failure"
    );
}

// --- metadata failure ---

#[tokio::test]
async fn metadata_failure_removes_the_item_without_partial_state() {
    let (downloader, _temp_dir) = create_test_downloader().await;
    let script = MockScript {
        series_error: true,
        ..MockScript::with_units(3, 2)
    };
    register_mock(&downloader, Provider::Mangadex, script);
    let events = EventCollector::attach(&downloader);

    downloader
        .download(request(Provider::Mangadex, "abc"))
        .await
        .unwrap();

    wait_until("failed item to be removed", || async {
        downloader.content("abc").await.is_none()
            && events
                .snapshot()
                .iter()
                .any(|e| matches!(e, Event::ContentRemoved { id } if id == "abc"))
    })
    .await;

    assert!(
        downloader.can_start(Provider::Mangadex).await,
        "no partial state may keep the provider busy"
    );
}

// --- shutdown ---

#[tokio::test]
async fn shutdown_cancels_active_downloads_and_returns() {
    let (downloader, _temp_dir) = create_test_downloader().await;
    let script = MockScript {
        stall: [(1, 1)].into_iter().collect(),
        ..MockScript::with_units(2, 2)
    };
    register_mock(&downloader, Provider::Mangadex, script);

    downloader
        .download(request(Provider::Mangadex, "abc"))
        .await
        .unwrap();
    wait_until("item to start downloading", || async {
        downloader
            .content("abc")
            .await
            .map(|info| info.downloading)
            .unwrap_or(false)
    })
    .await;

    let start = Instant::now();
    downloader.shutdown().await.unwrap();
    assert!(
        start.elapsed() < Duration::from_secs(10),
        "shutdown took {:?}",
        start.elapsed()
    );
    assert!(downloader.current_downloads().await.is_empty());
}
