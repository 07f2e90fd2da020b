use appbits_core::{PackagingError, archive_tool::NativeArchiveTool, size};
use appbits_test_support::{
    DeclaredSizesArchiveTool, GOOD_ZIP_SIZE, TestContext, ZipFixture, good_zip,
};
use assert_matches::assert_matches;

#[tokio::test]
async fn test_validate_returns_uncompressed_size() -> anyhow::Result<()> {
    let context = TestContext::new().await;
    let archive = context.write_zip("good.zip", &good_zip());

    let measured = size::validate(&NativeArchiveTool, &archive, Some(1024)).await?;

    assert_eq!(measured, GOOD_ZIP_SIZE);

    Ok(())
}

#[tokio::test]
async fn test_validate_is_idempotent() -> anyhow::Result<()> {
    let context = TestContext::new().await;
    let archive = context.write_zip(
        "big.zip",
        &ZipFixture::new().file("zeros", vec![0; 64 * 1024]),
    );

    // Highly compressible, so the archive itself is much smaller than the cap
    assert!(tokio::fs::metadata(&archive).await?.len() < 1024);

    for _ in 0..2 {
        let result = size::validate(&NativeArchiveTool, &archive, Some(1024)).await;
        assert_matches!(
            result,
            Err(PackagingError::PackageTooLarge { size: 65536, max: 1024 })
        );
    }
    for _ in 0..2 {
        let result = size::validate(&NativeArchiveTool, &archive, None).await;
        assert_matches!(result, Ok(65536));
    }

    Ok(())
}

#[tokio::test]
async fn test_validate_zero_disables_check() -> anyhow::Result<()> {
    let context = TestContext::new().await;
    let archive = context.write_zip("good.zip", &good_zip());

    assert_eq!(
        size::validate(&NativeArchiveTool, &archive, Some(0)).await?,
        GOOD_ZIP_SIZE
    );
    assert_eq!(
        size::validate(&NativeArchiveTool, &archive, Some(GOOD_ZIP_SIZE)).await?,
        GOOD_ZIP_SIZE
    );
    assert_matches!(
        size::validate(&NativeArchiveTool, &archive, Some(GOOD_ZIP_SIZE - 1)).await,
        Err(PackagingError::PackageTooLarge { .. })
    );

    Ok(())
}

#[tokio::test]
async fn test_too_large_message() -> anyhow::Result<()> {
    let context = TestContext::new().await;
    let archive = context.write_zip("good.zip", &good_zip());

    let error = size::validate(&NativeArchiveTool, &archive, Some(10))
        .await
        .unwrap_err();

    assert_eq!(
        error.to_string(),
        "package may not be larger than 10 bytes (got 17 bytes)"
    );

    Ok(())
}

#[tokio::test]
async fn test_validate_rejects_overflowing_sizes() -> anyhow::Result<()> {
    let context = TestContext::new().await;
    let archive = context.write_zip("good.zip", &good_zip());
    let tool = DeclaredSizesArchiveTool {
        sizes: vec![u64::MAX - 10, 5, 20],
    };

    for max_size in [Some(1024), Some(0), None] {
        let result = size::validate(&tool, &archive, max_size).await;
        assert_matches!(result, Err(PackagingError::InvalidArchive { .. }));
    }

    // The largest sum that still fits is measured, not rejected
    let tool = DeclaredSizesArchiveTool {
        sizes: vec![u64::MAX - 10, 10],
    };
    assert_matches!(
        size::validate(&tool, &archive, Some(1024)).await,
        Err(PackagingError::PackageTooLarge { size: u64::MAX, max: 1024 })
    );

    Ok(())
}
