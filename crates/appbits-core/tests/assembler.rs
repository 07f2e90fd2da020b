use std::os::unix::fs::PermissionsExt as _;

use appbits_core::{
    PackagingError,
    archive_tool::{CommandArchiveTool, EntryKind, NativeArchiveTool, read_entries},
    assembler,
    fingerprints::FingerprintSet,
};
use appbits_test_support::{
    FailingArchiveTool, Operation, TestContext, archive_entry_names, good_zip,
};
use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use serde_json::json;

async fn write_fake_package(context: &TestContext) -> std::path::PathBuf {
    context.write_file("fake_package/here.txt", "here").await;
    context
        .write_file("fake_package/subdir/there.txt", "there")
        .await;
    context
        .write_symlink("here.txt", "fake_package/coming_from_inside")
        .await;
    context.path("fake_package")
}

#[tokio::test]
async fn test_fetch_cached_files() -> anyhow::Result<()> {
    let context = TestContext::new().await;
    let cache = context.app_bits_cache();
    let config_sha = context.cache_blob("config: true\n").await;
    let script_sha = context.cache_blob("#!/bin/sh\n").await;
    let fingerprints = FingerprintSet::parse(&json!([
        { "fn": "config/app.yml", "sha1": config_sha, "mode": "644" },
        { "fn": "bin/run", "sha1": script_sha, "mode": "755" },
    ]))?;
    let fetch_root = context.mkdir("cached").await;

    assembler::fetch_cached_files(&cache, &fingerprints, &fetch_root, 4).await?;

    assert_eq!(
        tokio::fs::read_to_string(fetch_root.join("config/app.yml")).await?,
        "config: true\n"
    );
    let run_mode = tokio::fs::metadata(fetch_root.join("bin/run"))
        .await?
        .permissions()
        .mode();
    assert_eq!(run_mode & 0o777, 0o755);

    Ok(())
}

#[tokio::test]
async fn test_fetch_stale_fingerprint() -> anyhow::Result<()> {
    let context = TestContext::new().await;
    let cache = context.app_bits_cache();
    let present_sha = context.cache_blob("present").await;
    let fingerprints = FingerprintSet::parse(&json!([
        { "fn": "present.txt", "sha1": present_sha, "mode": "644" },
        { "fn": "a.txt", "sha1": "deadbeefdeadbeefdeadbeefdeadbeefdeadbeef", "mode": "644" },
    ]))?;
    let fetch_root = context.mkdir("cached").await;

    let result = assembler::fetch_cached_files(&cache, &fingerprints, &fetch_root, 1).await;

    assert_matches!(
        result,
        Err(PackagingError::StaleFingerprint { path, sha1 })
            if path == "a.txt" && sha1 == "deadbeefdeadbeefdeadbeefdeadbeefdeadbeef"
    );

    Ok(())
}

#[tokio::test]
async fn test_assemble_adds_files() -> anyhow::Result<()> {
    let context = TestContext::new().await;
    let archive = context.write_zip("good.zip", &good_zip());
    let extracted = context.mkdir("extracted").await;
    let additional = write_fake_package(&context).await;

    assembler::assemble(&NativeArchiveTool, &extracted, &additional, &archive).await?;

    let mut names = archive_entry_names(&archive).await;
    names.sort();
    assert_eq!(
        names,
        [
            "bye",
            "coming_from_inside",
            "here.txt",
            "hi",
            "subdir/",
            "subdir/greeting",
            "subdir/there.txt",
        ]
    );
    assert!(!names.iter().any(|name| name.contains("fake_package")));

    let entries = read_entries(&archive).await?;
    let link = entries
        .iter()
        .find(|entry| entry.name == "coming_from_inside")
        .unwrap();
    assert_eq!(link.kind, EntryKind::Symlink);
    assert_eq!(link.link_target.as_deref(), Some("here.txt"));

    Ok(())
}

#[tokio::test]
async fn test_assemble_empty_dir_is_noop() -> anyhow::Result<()> {
    let context = TestContext::new().await;
    let archive = context.write_zip("good.zip", &good_zip());
    let extracted = context.mkdir("extracted").await;
    let empty = context.mkdir("empty").await;
    let before = tokio::fs::read(&archive).await?;

    // The tool would fail if it were called at all
    let tool = FailingArchiveTool {
        fail_on: Operation::AddEntries,
    };
    assembler::assemble(&tool, &extracted, &empty, &archive).await?;

    assert_eq!(tokio::fs::read(&archive).await?, before);

    Ok(())
}

#[tokio::test]
async fn test_assemble_skips_files_from_upload() -> anyhow::Result<()> {
    let context = TestContext::new().await;
    let archive = context.write_zip("good.zip", &good_zip());
    let extracted = context.mkdir("extracted").await;
    appbits_core::extractor::extract(&NativeArchiveTool, &archive, &extracted).await?;

    context.write_file("cached/hi", "cached hi\n").await;
    let cached = context.path("cached");

    let tool = FailingArchiveTool {
        fail_on: Operation::AddEntries,
    };
    assembler::assemble(&tool, &extracted, &cached, &archive).await?;

    let entries = read_entries(&archive).await?;
    let hi = entries.iter().find(|entry| entry.name == "hi").unwrap();
    assert_eq!(hi.size, 3);

    Ok(())
}

#[tokio::test]
async fn test_assemble_tool_failure() -> anyhow::Result<()> {
    let context = TestContext::new().await;
    let archive = context.write_zip("good.zip", &good_zip());
    let extracted = context.mkdir("extracted").await;
    let additional = write_fake_package(&context).await;
    let tool = FailingArchiveTool {
        fail_on: Operation::AddEntries,
    };

    let result = assembler::assemble(&tool, &extracted, &additional, &archive).await;

    assert_matches!(result, Err(PackagingError::ToolFailure { .. }));

    Ok(())
}

#[tokio::test]
async fn test_assemble_with_zip() -> anyhow::Result<()> {
    if !appbits_test_support::command_tools_available().await {
        return Ok(());
    }

    let context = TestContext::new().await;
    let archive = context.write_zip("good.zip", &good_zip());
    let extracted = context.mkdir("extracted").await;
    let additional = write_fake_package(&context).await;

    assembler::assemble(
        &CommandArchiveTool::default(),
        &extracted,
        &additional,
        &archive,
    )
    .await?;

    let entries = read_entries(&archive).await?;
    let files = entries
        .iter()
        .filter(|entry| !entry.is_directory_like())
        .count();
    assert_eq!(files, 6);
    let link = entries
        .iter()
        .find(|entry| entry.name == "coming_from_inside")
        .unwrap();
    assert_eq!(link.kind, EntryKind::Symlink);

    Ok(())
}
