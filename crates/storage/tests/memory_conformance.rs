use runsync_storage::conformance::run_conformance_suite;
use runsync_storage::MemoryStorage;

#[tokio::test]
async fn memory_storage_passes_conformance() {
    let report = run_conformance_suite(|| async { MemoryStorage::new() }).await;
    assert!(report.total > 0, "suite ran no tests");
    assert_eq!(report.failed, 0, "{report}");
}
